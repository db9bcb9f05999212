//! Store-backed readiness.
//!
//! The service only reports ready once the store answered a ping, the
//! schema exists and the cache is warm. After that a background watcher
//! keeps pinging and flips readiness when the store goes away, so a load
//! balancer stops routing batches that would only fail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::retry::Backoff;
use crate::store::StoreClient;

const WATCH_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Default)]
pub struct ServiceStatus {
    ready: AtomicBool,
}

impl ServiceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Pings until the store answers. Retries forever with exponential backoff;
/// an unreachable store at boot is a wait, not a crash.
pub async fn wait_for_store(store: &StoreClient, backoff: Backoff) {
    let mut attempt: u32 = 0;
    loop {
        match store.ping().await {
            Ok(()) => {
                info!("store is reachable");
                return;
            }
            Err(error) => {
                let delay = backoff.delay(attempt);
                warn!(%error, attempt, ?delay, "store unreachable, retrying");
                sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Background readiness watcher. Never returns; run it on its own task.
pub async fn watch_store(store: StoreClient, status: std::sync::Arc<ServiceStatus>) {
    loop {
        sleep(WATCH_INTERVAL).await;

        let was_ready = status.is_ready();
        match store.ping().await {
            Ok(()) => {
                if !was_ready {
                    info!("store came back, ready again");
                }
                status.set_ready(true);
            }
            Err(error) => {
                if was_ready {
                    warn!(%error, "store went away, not ready");
                }
                status.set_ready(false);
            }
        }
    }
}
