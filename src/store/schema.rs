//! Store-side schema: one table triple per entity.
//!
//! Every entity `X` owns three objects: the final table `X` (deduplicating
//! engine, query-facing), the landing table `X_in` (`ENGINE = Null`, pure
//! insert sink), and the materialized view `X_mv` copying accepted rows from
//! landing to final. The landing column set and the view projection must
//! stay in lock-step with the final table: a drift is silent data loss, not
//! a runtime error, which is why both tables share one column block below.
//!
//! Trace spans additionally maintain `traces_trace_id_ts` (min/max
//! timestamp per trace id) fed by `traces_trace_id_ts_mv`, plus the
//! read-oriented `trace_view`.

use clickhouse::sql::Identifier;

use crate::error::StoreError;
use crate::store::StoreClient;

pub const PIPELINES_TABLE: &str = "pipelines";
pub const JOBS_TABLE: &str = "jobs";
pub const BRIDGES_TABLE: &str = "bridges";
pub const SECTIONS_TABLE: &str = "sections";
pub const TEST_REPORTS_TABLE: &str = "testreports";
pub const TEST_SUITES_TABLE: &str = "testsuites";
pub const TEST_CASES_TABLE: &str = "testcases";
pub const MERGE_REQUESTS_TABLE: &str = "mergerequests";
pub const MERGE_REQUEST_NOTE_EVENTS_TABLE: &str = "mergerequest_noteevents";
pub const METRICS_TABLE: &str = "metrics";
pub const PROJECTS_TABLE: &str = "projects";
pub const COVERAGE_REPORTS_TABLE: &str = "coverage_reports";
pub const DEPLOYMENTS_TABLE: &str = "deployments";
pub const TRACE_SPANS_TABLE: &str = "traces";

pub fn landing(table: &str) -> String {
    format!("{table}_in")
}

pub fn transform_view(table: &str) -> String {
    format!("{table}_mv")
}

struct EntityDdl {
    table: &'static str,
    columns: &'static str,
    engine: &'static str,
}

const PIPELINES_COLUMNS: &str = "
    id Int64,
    iid Int64,
    project_id Int64,
    name String,
    ref String,
    sha String,
    source String,
    status String,
    failure_reason String,
    committed_at Float64,
    created_at Float64,
    updated_at Float64,
    started_at Float64,
    finished_at Float64,
    queued_duration Float64,
    duration Float64,
    coverage Float64,
    warnings Bool,
    yaml_errors Bool,
    child Bool,
    upstream_pipeline_id Int64,
    merge_request_id Int64,
    user_id Int64
";

const JOBS_COLUMNS: &str = "
    id Int64,
    pipeline_id Int64,
    project_id Int64,
    name String,
    ref String,
    status String,
    failure_reason String,
    exit_code Int64,
    created_at Float64,
    queued_at Float64,
    started_at Float64,
    finished_at Float64,
    erased_at Float64,
    queued_duration Float64,
    duration Float64,
    coverage Float64,
    stage String,
    tag_list Array(String),
    allow_failure Bool,
    manual Bool,
    retried Bool,
    retryable Bool,
    kind String,
    downstream_pipeline_id Int64,
    runner_id String
";

const BRIDGES_COLUMNS: &str = "
    id Int64,
    pipeline_id Int64,
    project_id Int64,
    name String,
    ref String,
    status String,
    failure_reason String,
    created_at Float64,
    started_at Float64,
    finished_at Float64,
    erased_at Float64,
    queued_duration Float64,
    duration Float64,
    stage String,
    allow_failure Bool,
    downstream_pipeline_id Int64,
    downstream_pipeline_iid Int64,
    downstream_pipeline_project_id Int64
";

const SECTIONS_COLUMNS: &str = "
    id Int64,
    job_id Int64,
    pipeline_id Int64,
    project_id Int64,
    name String,
    started_at Float64,
    finished_at Float64,
    duration Float64
";

const TEST_REPORTS_COLUMNS: &str = "
    id String,
    job_id Int64,
    pipeline_id Int64,
    project_id Int64,
    total_time Float64,
    total_count Int64,
    error_count Int64,
    failed_count Int64,
    skipped_count Int64,
    success_count Int64
";

const TEST_SUITES_COLUMNS: &str = "
    id String,
    testreport_id String,
    job_id Int64,
    pipeline_id Int64,
    project_id Int64,
    name String,
    total_time Float64,
    total_count Int64,
    error_count Int64,
    failed_count Int64,
    skipped_count Int64,
    success_count Int64,
    properties Array(Tuple(name String, value String))
";

const TEST_CASES_COLUMNS: &str = "
    id String,
    testsuite_id String,
    testreport_id String,
    job_id Int64,
    pipeline_id Int64,
    project_id Int64,
    status String,
    name String,
    classname String,
    file String,
    execution_time Float64,
    system_output String,
    stack_trace String,
    attachment_url String,
    properties Array(Tuple(name String, value String))
";

const MERGE_REQUESTS_COLUMNS: &str = "
    id Int64,
    iid Int64,
    project_id Int64,
    created_at Float64,
    updated_at Float64,
    merged_at Float64,
    closed_at Float64,
    title String,
    labels Array(String),
    state String,
    merge_status String,
    merge_error String,
    source_project_id Int64,
    source_branch String,
    target_project_id Int64,
    target_branch String,
    base_sha String,
    head_sha String,
    start_sha String,
    merge_commit_sha String,
    author_id Int64,
    assignees_id Array(Int64),
    reviewers_id Array(Int64),
    merge_user_id Int64,
    approved Bool,
    conflicts Bool,
    draft Bool,
    milestone_id Int64
";

const MERGE_REQUEST_NOTE_EVENTS_COLUMNS: &str = "
    id Int64,
    mergerequest_id Int64,
    mergerequest_iid Int64,
    mergerequest_project_id Int64,
    created_at Float64,
    updated_at Float64,
    resolved_at Float64,
    type String,
    system Bool,
    internal Bool,
    author_id Int64,
    author_username String,
    author_name String,
    resolvable Bool,
    resolved Bool,
    resolver_id Int64,
    resolver_username String,
    resolver_name String
";

const METRICS_COLUMNS: &str = "
    id String,
    iid Int64,
    job_id Int64,
    pipeline_id Int64,
    project_id Int64,
    name String,
    labels Map(String, String),
    value Float64,
    timestamp Int64
";

const PROJECTS_COLUMNS: &str = "
    id Int64,
    namespace_id Int64,
    name String,
    full_name String,
    path String,
    full_path String,
    description String,
    visibility String,
    created_at Float64,
    updated_at Float64,
    last_activity_at Float64,
    topics Array(String),
    default_branch String,
    archived Bool,
    forks_count Int64,
    stars_count Int64,
    commit_count Int64,
    open_issues_count Int64,
    storage_size Int64,
    repository_size Int64,
    job_artifacts_size Int64
";

const COVERAGE_REPORTS_COLUMNS: &str = "
    id String,
    job_id Int64,
    pipeline_id Int64,
    project_id Int64,
    line_rate Float32,
    lines_covered Int32,
    lines_valid Int32,
    branch_rate Float32,
    branches_covered Int32,
    branches_valid Int32,
    complexity Float32,
    version String,
    timestamp Int64,
    source_paths Array(String)
";

const DEPLOYMENTS_COLUMNS: &str = "
    id Int64,
    iid Int64,
    environment_id Int64,
    environment_name String,
    environment_tier String,
    project_id Int64,
    job_id Int64,
    pipeline_id Int64,
    triggerer_id Int64,
    created_at Float64,
    updated_at Float64,
    finished_at Float64,
    status String,
    ref String,
    sha String
";

const TRACE_SPANS_COLUMNS: &str = "
    Timestamp DateTime64(9) CODEC(Delta, ZSTD(1)),
    TraceId String CODEC(ZSTD(1)),
    SpanId String CODEC(ZSTD(1)),
    ParentSpanId String CODEC(ZSTD(1)),
    TraceState String CODEC(ZSTD(1)),
    SpanName LowCardinality(String) CODEC(ZSTD(1)),
    SpanKind LowCardinality(String) CODEC(ZSTD(1)),
    ServiceName LowCardinality(String) CODEC(ZSTD(1)),
    ResourceAttributes Map(LowCardinality(String), String) CODEC(ZSTD(1)),
    ScopeName String CODEC(ZSTD(1)),
    ScopeVersion String CODEC(ZSTD(1)),
    SpanAttributes Map(LowCardinality(String), String) CODEC(ZSTD(1)),
    Duration Int64 CODEC(ZSTD(1)),
    StatusCode LowCardinality(String) CODEC(ZSTD(1)),
    StatusMessage String CODEC(ZSTD(1)),
    EventTimestamps Array(Int64) CODEC(ZSTD(1)),
    EventNames Array(String) CODEC(ZSTD(1)),
    LinkTraceIds Array(String) CODEC(ZSTD(1)),
    LinkSpanIds Array(String) CODEC(ZSTD(1)),
    LinkTraceStates Array(String) CODEC(ZSTD(1))
";

const ENTITY_DDL: &[EntityDdl] = &[
    EntityDdl {
        table: PIPELINES_TABLE,
        columns: PIPELINES_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree(updated_at) ORDER BY id",
    },
    EntityDdl {
        table: JOBS_TABLE,
        columns: JOBS_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree() ORDER BY id",
    },
    EntityDdl {
        table: BRIDGES_TABLE,
        columns: BRIDGES_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree() ORDER BY id",
    },
    EntityDdl {
        table: SECTIONS_TABLE,
        columns: SECTIONS_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree() ORDER BY id",
    },
    EntityDdl {
        table: TEST_REPORTS_TABLE,
        columns: TEST_REPORTS_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree() ORDER BY id",
    },
    EntityDdl {
        table: TEST_SUITES_TABLE,
        columns: TEST_SUITES_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree() ORDER BY id",
    },
    EntityDdl {
        table: TEST_CASES_TABLE,
        columns: TEST_CASES_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree() ORDER BY id",
    },
    EntityDdl {
        table: MERGE_REQUESTS_TABLE,
        columns: MERGE_REQUESTS_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree(updated_at) ORDER BY id",
    },
    EntityDdl {
        table: MERGE_REQUEST_NOTE_EVENTS_TABLE,
        columns: MERGE_REQUEST_NOTE_EVENTS_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree(updated_at) ORDER BY id",
    },
    EntityDdl {
        table: METRICS_TABLE,
        columns: METRICS_COLUMNS,
        engine: "ENGINE = MergeTree() ORDER BY (job_id, name, timestamp)",
    },
    EntityDdl {
        table: PROJECTS_TABLE,
        columns: PROJECTS_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree(updated_at) ORDER BY id",
    },
    EntityDdl {
        table: COVERAGE_REPORTS_TABLE,
        columns: COVERAGE_REPORTS_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree() ORDER BY id",
    },
    EntityDdl {
        table: DEPLOYMENTS_TABLE,
        columns: DEPLOYMENTS_COLUMNS,
        engine: "ENGINE = ReplacingMergeTree(updated_at) ORDER BY id",
    },
    EntityDdl {
        table: TRACE_SPANS_TABLE,
        columns: TRACE_SPANS_COLUMNS,
        engine: "ENGINE = MergeTree() \
                 PARTITION BY toDate(Timestamp) \
                 ORDER BY (ServiceName, SpanName, toUnixTimestamp(Timestamp), TraceId) \
                 SETTINGS index_granularity = 8192, ttl_only_drop_parts = 1",
    },
];

const TRACE_ID_TS_DDL: &str = "
CREATE TABLE IF NOT EXISTS ? (
    TraceId String CODEC(ZSTD(1)),
    Start DateTime64(9) CODEC(Delta, ZSTD(1)),
    End DateTime64(9) CODEC(Delta, ZSTD(1))
)
ENGINE = MergeTree()
ORDER BY (TraceId, toUnixTimestamp(Start))
SETTINGS index_granularity = 8192
";

const TRACE_ID_TS_MV_DDL: &str = "
CREATE MATERIALIZED VIEW IF NOT EXISTS ? TO ?
AS SELECT
    TraceId,
    min(Timestamp) AS Start,
    max(Timestamp) AS End
FROM ?
WHERE TraceId != ''
GROUP BY TraceId
";

const TRACE_VIEW_DDL: &str = "
CREATE VIEW IF NOT EXISTS ? AS
SELECT
    TraceId AS traceID,
    SpanId AS spanID,
    SpanName AS operationName,
    ParentSpanId AS parentSpanID,
    ServiceName AS serviceName,
    Duration / 1000000 AS duration,
    Timestamp AS startTime,
    arrayMap(key -> map('key', key, 'value', SpanAttributes[key]), mapKeys(SpanAttributes)) AS tags,
    arrayMap(key -> map('key', key, 'value', ResourceAttributes[key]), mapKeys(ResourceAttributes)) AS serviceTags
FROM ?
WHERE TraceId = {trace_id:String}
";

/// Creates every table triple idempotently. Run at startup before the cache
/// warm-up scans.
pub async fn ensure_schema(store: &StoreClient) -> Result<(), StoreError> {
    for entity in ENTITY_DDL {
        let final_sql = format!("CREATE TABLE IF NOT EXISTS ? ({}) {}", entity.columns, entity.engine);
        let landing_sql = format!(
            "CREATE TABLE IF NOT EXISTS ? ({}) ENGINE = Null",
            entity.columns
        );
        let landing_table = landing(entity.table);
        let view = transform_view(entity.table);

        let _permit = store.acquire().await;
        store
            .client()
            .query(&final_sql)
            .bind(Identifier(entity.table))
            .execute()
            .await?;
        store
            .client()
            .query(&landing_sql)
            .bind(Identifier(&landing_table))
            .execute()
            .await?;
        store
            .client()
            .query("CREATE MATERIALIZED VIEW IF NOT EXISTS ? TO ? AS SELECT * FROM ?")
            .bind(Identifier(&view))
            .bind(Identifier(entity.table))
            .bind(Identifier(&landing_table))
            .execute()
            .await?;
    }

    let trace_id_ts = format!("{TRACE_SPANS_TABLE}_trace_id_ts");
    let trace_id_ts_mv = format!("{TRACE_SPANS_TABLE}_trace_id_ts_mv");

    let _permit = store.acquire().await;
    store
        .client()
        .query(TRACE_ID_TS_DDL)
        .bind(Identifier(&trace_id_ts))
        .execute()
        .await?;
    store
        .client()
        .query(TRACE_ID_TS_MV_DDL)
        .bind(Identifier(&trace_id_ts_mv))
        .bind(Identifier(&trace_id_ts))
        .bind(Identifier(TRACE_SPANS_TABLE))
        .execute()
        .await?;
    store
        .client()
        .query(TRACE_VIEW_DDL)
        .bind(Identifier("trace_view"))
        .bind(Identifier(TRACE_SPANS_TABLE))
        .execute()
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_convention_is_stable() {
        assert_eq!(landing("pipelines"), "pipelines_in");
        assert_eq!(transform_view("pipelines"), "pipelines_mv");
    }

    #[test]
    fn landing_and_final_share_one_column_block() {
        // The two CREATE statements are built from the same constant, so a
        // column added to one side cannot drift from the other.
        for entity in ENTITY_DDL {
            assert!(entity.columns.contains("id") || entity.table == TRACE_SPANS_TABLE);
            assert!(!entity.columns.contains('?'));
            assert!(!entity.engine.contains('?'));
        }
    }
}
