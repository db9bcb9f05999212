use thiserror::Error;

/// A single record that could not be processed. Rejections never abort the
/// rest of the batch.
#[derive(Debug, Error)]
#[error("{entity} {id}: {reason}")]
pub struct RowError {
    pub entity: &'static str,
    pub id: String,
    pub reason: &'static str,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("prepare batch: {0}")]
    Prepare(#[source] clickhouse::error::Error),

    #[error("append batch: {0}")]
    Append(#[source] clickhouse::error::Error),

    #[error("send batch: {0}")]
    Send(#[source] clickhouse::error::Error),

    /// Some records were rejected during validation; the remaining
    /// `recorded` rows were still written.
    #[error("{} record(s) rejected, {recorded} recorded", .errors.len())]
    Rejected { recorded: u64, errors: Vec<RowError> },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("clickhouse: {0}")]
    Client(#[from] clickhouse::error::Error),

    #[error("deduplicate: --by and --except are mutually exclusive")]
    ConflictingColumns,
}
