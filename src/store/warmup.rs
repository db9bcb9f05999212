//! Cache hydration from the final tables.
//!
//! Runs once at startup, after the schema exists and before the service
//! reports ready. Each scan reads only the columns the cache indexes: ids
//! for presence sets, `(id, max(updated_at))` for versioned entities and the
//! distinct parent ids for grouped entities.

use clickhouse::sql::Identifier;
use clickhouse::Row;
use serde::Deserialize;
use tracing::info;

use crate::cache::{DedupCache, SpanKey};
use crate::error::StoreError;
use crate::store::{schema, StoreClient};

#[derive(Row, Deserialize)]
struct IdVersionRow {
    id: i64,
    updated_at: f64,
}

#[derive(Row, Deserialize)]
struct Int64IdRow {
    id: i64,
}

#[derive(Row, Deserialize)]
struct StringIdRow {
    id: String,
}

#[derive(Row, Deserialize)]
struct SpanKeyRow {
    #[serde(rename = "TraceId")]
    trace_id: String,
    #[serde(rename = "SpanId")]
    span_id: String,
}

async fn scan_versions(store: &StoreClient, table: &str) -> Result<Vec<(i64, f64)>, StoreError> {
    let _permit = store.acquire().await;
    let rows = store
        .client()
        .query("SELECT id, max(updated_at) AS updated_at FROM ? GROUP BY id")
        .bind(Identifier(table))
        .fetch_all::<IdVersionRow>()
        .await?;
    Ok(rows.into_iter().map(|r| (r.id, r.updated_at)).collect())
}

async fn scan_int64_ids(
    store: &StoreClient,
    table: &str,
    column: &str,
) -> Result<Vec<i64>, StoreError> {
    let _permit = store.acquire().await;
    let rows = store
        .client()
        .query("SELECT DISTINCT ? AS id FROM ?")
        .bind(Identifier(column))
        .bind(Identifier(table))
        .fetch_all::<Int64IdRow>()
        .await?;
    Ok(rows.into_iter().map(|r| r.id).collect())
}

async fn scan_string_ids(
    store: &StoreClient,
    table: &str,
    column: &str,
) -> Result<Vec<String>, StoreError> {
    let _permit = store.acquire().await;
    let rows = store
        .client()
        .query("SELECT DISTINCT ? AS id FROM ?")
        .bind(Identifier(column))
        .bind(Identifier(table))
        .fetch_all::<StringIdRow>()
        .await?;
    Ok(rows.into_iter().map(|r| r.id).collect())
}

async fn scan_span_keys(store: &StoreClient) -> Result<Vec<SpanKey>, StoreError> {
    let _permit = store.acquire().await;
    let rows = store
        .client()
        .query("SELECT DISTINCT TraceId, SpanId FROM ?")
        .bind(Identifier(schema::TRACE_SPANS_TABLE))
        .fetch_all::<SpanKeyRow>()
        .await?;
    Ok(rows.into_iter().map(|r| (r.trace_id, r.span_id)).collect())
}

/// Hydrates every cache index from its final table. Scans run sequentially,
/// so the semaphore gate (if any) is never starved by startup.
pub async fn warm_up(store: &StoreClient, cache: &DedupCache) -> Result<(), StoreError> {
    let pipelines = scan_versions(store, schema::PIPELINES_TABLE).await?;
    info!(entries = pipelines.len(), "warmed pipelines index");
    cache.warm_pipelines(pipelines);

    let merge_requests = scan_versions(store, schema::MERGE_REQUESTS_TABLE).await?;
    info!(entries = merge_requests.len(), "warmed merge requests index");
    cache.warm_merge_requests(merge_requests);

    let note_events = scan_versions(store, schema::MERGE_REQUEST_NOTE_EVENTS_TABLE).await?;
    info!(entries = note_events.len(), "warmed note events index");
    cache.warm_merge_request_note_events(note_events);

    let projects = scan_versions(store, schema::PROJECTS_TABLE).await?;
    info!(entries = projects.len(), "warmed projects index");
    cache.warm_projects(projects);

    let jobs = scan_int64_ids(store, schema::JOBS_TABLE, "id").await?;
    info!(entries = jobs.len(), "warmed jobs index");
    cache.warm_jobs(jobs);

    let bridges = scan_int64_ids(store, schema::BRIDGES_TABLE, "id").await?;
    info!(entries = bridges.len(), "warmed bridges index");
    cache.warm_bridges(bridges);

    let test_reports = scan_string_ids(store, schema::TEST_REPORTS_TABLE, "id").await?;
    info!(entries = test_reports.len(), "warmed test reports index");
    cache.warm_test_reports(test_reports);

    let test_suites = scan_string_ids(store, schema::TEST_SUITES_TABLE, "id").await?;
    info!(entries = test_suites.len(), "warmed test suites index");
    cache.warm_test_suites(test_suites);

    let coverage_reports = scan_string_ids(store, schema::COVERAGE_REPORTS_TABLE, "id").await?;
    info!(entries = coverage_reports.len(), "warmed coverage reports index");
    cache.warm_coverage_reports(coverage_reports);

    let deployments = scan_int64_ids(store, schema::DEPLOYMENTS_TABLE, "id").await?;
    info!(entries = deployments.len(), "warmed deployments index");
    cache.warm_deployments(deployments);

    let sections = scan_int64_ids(store, schema::SECTIONS_TABLE, "job_id").await?;
    info!(entries = sections.len(), "warmed sections index");
    cache.warm_sections(sections);

    let test_cases = scan_string_ids(store, schema::TEST_CASES_TABLE, "testsuite_id").await?;
    info!(entries = test_cases.len(), "warmed test cases index");
    cache.warm_test_cases(test_cases);

    let metrics = scan_int64_ids(store, schema::METRICS_TABLE, "job_id").await?;
    info!(entries = metrics.len(), "warmed metrics index");
    cache.warm_metrics(metrics);

    let spans = scan_span_keys(store).await?;
    info!(entries = spans.len(), "warmed trace spans index");
    cache.warm_trace_spans(spans);

    Ok(())
}
