pub mod maintenance;
pub mod schema;
pub mod warmup;

use std::sync::Arc;

use clickhouse::{Client, Row};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::config::Config;
use crate::error::RecordError;

/// Wrapper around the ClickHouse client: carries the target database,
/// enables async inserts, and optionally gates every network call behind a
/// bounded semaphore so a burst of recording requests cannot exhaust the
/// store's connection budget.
#[derive(Clone)]
pub struct StoreClient {
    client: Client,
    database: String,
    query_gate: Option<Arc<Semaphore>>,
}

impl StoreClient {
    pub fn new(config: &Config) -> Self {
        let client = Client::default()
            .with_url(config.clickhouse_url.clone())
            .with_database(config.clickhouse_database.clone())
            .with_user(config.clickhouse_user.clone())
            .with_password(config.clickhouse_password.clone())
            .with_option("async_insert", "1")
            .with_option("wait_for_async_insert", "0");

        let query_gate = (config.max_concurrent_queries > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_queries)));

        Self {
            client,
            database: config.clickhouse_database.clone(),
            query_gate,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Blocks until a query slot is free; callers hold the permit for the
    /// duration of the network call. Cancellable by dropping the future.
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.query_gate {
            // The gate is never closed, so acquire only fails at shutdown.
            Some(gate) => gate.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    pub async fn ping(&self) -> Result<(), clickhouse::error::Error> {
        let _permit = self.acquire().await;
        self.client.query("SELECT 1").execute().await
    }

    /// Writes rows to `table` as a single batch and reports how many were
    /// accepted. The caller is expected to have filtered the rows already.
    pub async fn insert_rows<T>(&self, table: &str, rows: &[T]) -> Result<u64, RecordError>
    where
        T: Row + Serialize,
    {
        let _permit = self.acquire().await;

        let mut insert = self.client.insert::<T>(table).map_err(RecordError::Prepare)?;
        for row in rows {
            insert.write(row).await.map_err(RecordError::Append)?;
        }
        insert.end().await.map_err(RecordError::Send)?;

        Ok(rows.len() as u64)
    }

    pub async fn connect_check(&self) -> Result<(), clickhouse::error::Error> {
        self.ping().await?;
        info!(database = %self.database, "connected to clickhouse");
        Ok(())
    }
}
