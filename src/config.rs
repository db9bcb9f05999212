use std::str::FromStr;

use envconfig::Envconfig;

/// When the dedup cache is mutated relative to the batch send.
///
/// `MutateBeforeSend` matches the historical behavior: decisions are
/// recorded before the store confirms the write and are not rolled back on a
/// send failure, so a retried batch is silently skipped. `MutateAfterConfirm`
/// peeks without mutating and commits decisions only once the send
/// succeeded; two concurrent batches carrying the same key may then both be
/// written, which the ReplacingMergeTree backstop collapses later.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WritePolicy {
    #[default]
    MutateBeforeSend,
    MutateAfterConfirm,
}

impl FromStr for WritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "mutate-before-send" => Ok(WritePolicy::MutateBeforeSend),
            "mutate-after-confirm" => Ok(WritePolicy::MutateAfterConfirm),
            _ => Err(format!(
                "unknown write policy: {s}, must be mutate-before-send or mutate-after-confirm"
            )),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3311")]
    pub port: u16,

    #[envconfig(from = "CLICKHOUSE_URL", default = "http://localhost:8123")]
    pub clickhouse_url: String,

    #[envconfig(from = "CLICKHOUSE_DATABASE", default = "ci")]
    pub clickhouse_database: String,

    #[envconfig(from = "CLICKHOUSE_USER", default = "default")]
    pub clickhouse_user: String,

    #[envconfig(from = "CLICKHOUSE_PASSWORD", default = "")]
    pub clickhouse_password: String,

    /// Upper bound on in-flight store queries, 0 means unlimited.
    #[envconfig(from = "MAX_CONCURRENT_QUERIES", default = "0")]
    pub max_concurrent_queries: usize,

    #[envconfig(from = "WRITE_POLICY", default = "mutate-before-send")]
    pub write_policy: WritePolicy,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }
}
