use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer};

use ci_capture::cache::DedupCache;
use ci_capture::config::Config;
use ci_capture::health::{self, ServiceStatus};
use ci_capture::recorder::Recorder;
use ci_capture::retry::Backoff;
use ci_capture::store::maintenance::{deduplicate_table, DeduplicateOptions};
use ci_capture::store::{schema, warmup, StoreClient};

#[derive(Parser)]
#[command(name = "ci-capture", about = "CI/CD telemetry recorder for ClickHouse")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the recorder service.
    Run,

    /// Create the database schema and exit.
    InitSchema,

    /// Force merge-time deduplication of a table.
    Deduplicate {
        /// Table to deduplicate.
        table: String,

        /// Rewrite already merged parts too (disable with --final=false).
        #[arg(long = "final", default_value_t = true, action = ArgAction::Set)]
        run_final: bool,

        /// Deduplicate by exactly these columns.
        #[arg(long, value_delimiter = ',')]
        by: Vec<String>,

        /// Deduplicate by every column except these.
        #[arg(long, value_delimiter = ',')]
        except: Vec<String>,

        /// Fail when the statement does nothing (disable with
        /// --throw-if-noop=false).
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        throw_if_noop: bool,
    },
}

fn setup_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let log_layer = tracing_subscriber::fmt::layer()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let cli = Cli::parse();
    let config = Config::init_with_defaults().context("loading configuration")?;
    let store = StoreClient::new(&config);

    match cli.command {
        Command::Run => run(config, store).await,
        Command::InitSchema => {
            store.connect_check().await?;
            schema::ensure_schema(&store).await?;
            info!(database = store.database(), "schema created");
            Ok(())
        }
        Command::Deduplicate {
            table,
            run_final,
            by,
            except,
            throw_if_noop,
        } => {
            let options = DeduplicateOptions {
                final_: run_final,
                by,
                except,
                throw_if_noop,
            };
            store.connect_check().await?;
            deduplicate_table(&store, &table, &options).await?;
            info!(table, "table deduplicated");
            Ok(())
        }
    }
}

/// Shared handle for everything the served surface needs: the readiness
/// flag and the recorder an ingest binding attaches to.
#[derive(Clone)]
struct AppState {
    status: Arc<ServiceStatus>,
    recorder: Arc<Recorder>,
}

async fn run(config: Config, store: StoreClient) -> anyhow::Result<()> {
    let status = Arc::new(ServiceStatus::new());
    let cache = Arc::new(DedupCache::new());
    let recorder = Arc::new(Recorder::new(
        store.clone(),
        cache.clone(),
        config.write_policy,
    ));
    let state = AppState {
        status: status.clone(),
        recorder,
    };

    let addr = SocketAddr::new(config.host.parse().context("parsing bind host")?, config.port);
    let router = Router::new()
        .route("/_liveness", get(|| async { "ok" }))
        .route("/_readiness", get(readiness))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding probe listener")?;
    info!(%addr, "probes listening");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(%error, "probe server terminated");
        }
    });

    // Not ready until the store answers, the schema exists and the cache
    // holds everything already persisted.
    health::wait_for_store(&store, Backoff::default()).await;
    schema::ensure_schema(&store).await?;
    warmup::warm_up(&store, &cache).await?;

    status.set_ready(true);
    info!(cached_keys = cache.len(), "recorder ready");
    tokio::spawn(health::watch_store(store, status));

    tokio::signal::ctrl_c().await.context("waiting for shutdown")?;
    info!("shutting down");
    Ok(())
}

async fn readiness(State(state): State<AppState>) -> (StatusCode, String) {
    if state.status.is_ready() {
        let cached = state.recorder.cache().len();
        (StatusCode::OK, format!("ready, {cached} cached keys"))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready".to_string(),
        )
    }
}
