//! Entity records as they land in ClickHouse.
//!
//! Each struct doubles as the domain object handed to the recorder and the
//! row written to the entity's landing table, so field names and order are
//! part of the schema contract in `store::schema`. Parent references are
//! denormalized inline (`pipeline_id`, `project_id`, ...) to avoid joins at
//! query time.

use std::collections::HashMap;

use clickhouse::Row;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub iid: i64,
    pub project_id: i64,

    pub name: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
    pub source: String,
    pub status: String,
    pub failure_reason: String,

    pub committed_at: f64,
    pub created_at: f64,
    pub updated_at: f64,
    pub started_at: f64,
    pub finished_at: f64,

    pub queued_duration: f64,
    pub duration: f64,
    pub coverage: f64,

    pub warnings: bool,
    pub yaml_errors: bool,

    pub child: bool,
    pub upstream_pipeline_id: i64,
    pub merge_request_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,

    pub name: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub status: String,
    pub failure_reason: String,
    pub exit_code: i64,

    pub created_at: f64,
    pub queued_at: f64,
    pub started_at: f64,
    pub finished_at: f64,
    pub erased_at: f64,

    pub queued_duration: f64,
    pub duration: f64,
    pub coverage: f64,

    pub stage: String,
    pub tag_list: Vec<String>,

    pub allow_failure: bool,
    pub manual: bool,
    pub retried: bool,
    pub retryable: bool,

    pub kind: String,
    pub downstream_pipeline_id: i64,
    pub runner_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct Bridge {
    pub id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,

    pub name: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub status: String,
    pub failure_reason: String,

    pub created_at: f64,
    pub started_at: f64,
    pub finished_at: f64,
    pub erased_at: f64,

    pub queued_duration: f64,
    pub duration: f64,

    pub stage: String,
    pub allow_failure: bool,

    pub downstream_pipeline_id: i64,
    pub downstream_pipeline_iid: i64,
    pub downstream_pipeline_project_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct Section {
    pub id: i64,
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,

    pub name: String,

    pub started_at: f64,
    pub finished_at: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct TestReport {
    pub id: String,
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,

    pub total_time: f64,
    pub total_count: i64,
    pub error_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub success_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    pub testreport_id: String,
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,

    pub name: String,
    pub total_time: f64,
    pub total_count: i64,
    pub error_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub success_count: i64,

    pub properties: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub testsuite_id: String,
    pub testreport_id: String,
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,

    pub status: String,
    pub name: String,
    pub classname: String,
    pub file: String,
    pub execution_time: f64,
    pub system_output: String,
    pub stack_trace: String,
    pub attachment_url: String,

    pub properties: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: i64,
    pub iid: i64,
    pub project_id: i64,

    pub created_at: f64,
    pub updated_at: f64,
    pub merged_at: f64,
    pub closed_at: f64,

    pub title: String,
    pub labels: Vec<String>,

    pub state: String,
    pub merge_status: String,
    pub merge_error: String,

    pub source_project_id: i64,
    pub source_branch: String,
    pub target_project_id: i64,
    pub target_branch: String,

    pub base_sha: String,
    pub head_sha: String,
    pub start_sha: String,
    pub merge_commit_sha: String,

    pub author_id: i64,
    pub assignees_id: Vec<i64>,
    pub reviewers_id: Vec<i64>,
    pub merge_user_id: i64,

    pub approved: bool,
    pub conflicts: bool,
    pub draft: bool,

    pub milestone_id: i64,
}

/// A note (comment) event on a merge request. The note kind lands under its
/// wire name `type`.
#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct MergeRequestNoteEvent {
    pub id: i64,
    pub mergerequest_id: i64,
    pub mergerequest_iid: i64,
    pub mergerequest_project_id: i64,

    pub created_at: f64,
    pub updated_at: f64,
    pub resolved_at: f64,

    #[serde(rename = "type")]
    pub note_type: String,
    pub system: bool,
    pub internal: bool,

    pub author_id: i64,
    pub author_username: String,
    pub author_name: String,

    pub resolvable: bool,
    pub resolved: bool,
    pub resolver_id: i64,
    pub resolver_username: String,
    pub resolver_name: String,
}

/// A metric scraped out of a job log, grouped in the cache by its job.
#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub iid: i64,
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,

    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub namespace_id: i64,

    pub name: String,
    pub full_name: String,
    pub path: String,
    pub full_path: String,
    pub description: String,
    pub visibility: String,

    pub created_at: f64,
    pub updated_at: f64,
    pub last_activity_at: f64,

    pub topics: Vec<String>,
    pub default_branch: String,
    pub archived: bool,

    pub forks_count: i64,
    pub stars_count: i64,
    pub commit_count: i64,
    pub open_issues_count: i64,

    pub storage_size: i64,
    pub repository_size: i64,
    pub job_artifacts_size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct CoverageReport {
    pub id: String,
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,

    pub line_rate: f32,
    pub lines_covered: i32,
    pub lines_valid: i32,

    pub branch_rate: f32,
    pub branches_covered: i32,
    pub branches_valid: i32,

    pub complexity: f32,

    pub version: String,
    pub timestamp: i64,

    pub source_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Row, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub iid: i64,

    pub environment_id: i64,
    pub environment_name: String,
    pub environment_tier: String,

    pub project_id: i64,
    pub job_id: i64,
    pub pipeline_id: i64,

    pub triggerer_id: i64,

    pub created_at: f64,
    pub updated_at: f64,
    pub finished_at: f64,

    pub status: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
}

// --- Trace spans ---
//
// Trace payloads arrive with spans nested three levels deep
// (payload -> resource -> scope -> span); the recorder flattens them into
// `SpanRow`s. Only the flattened row is part of the schema contract.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TracePayload {
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpans {
    pub resource_attributes: HashMap<String, String>,
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpans {
    pub scope_name: String,
    pub scope_version: String,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub trace_state: String,
    pub name: String,
    pub kind: String,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub status_code: String,
    pub status_message: String,
    pub attributes: HashMap<String, String>,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub time_unix_nano: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
    pub trace_state: String,
}

/// Flattened trace span row. Column names follow the OpenTelemetry
/// ClickHouse exporter convention, which downstream trace tooling expects.
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct SpanRow {
    #[serde(
        rename = "Timestamp",
        with = "clickhouse::serde::time::datetime64::nanos"
    )]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "TraceId")]
    pub trace_id: String,
    #[serde(rename = "SpanId")]
    pub span_id: String,
    #[serde(rename = "ParentSpanId")]
    pub parent_span_id: String,
    #[serde(rename = "TraceState")]
    pub trace_state: String,
    #[serde(rename = "SpanName")]
    pub span_name: String,
    #[serde(rename = "SpanKind")]
    pub span_kind: String,
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "ResourceAttributes")]
    pub resource_attributes: HashMap<String, String>,
    #[serde(rename = "ScopeName")]
    pub scope_name: String,
    #[serde(rename = "ScopeVersion")]
    pub scope_version: String,
    #[serde(rename = "SpanAttributes")]
    pub span_attributes: HashMap<String, String>,
    #[serde(rename = "Duration")]
    pub duration: i64,
    #[serde(rename = "StatusCode")]
    pub status_code: String,
    #[serde(rename = "StatusMessage")]
    pub status_message: String,
    #[serde(rename = "EventTimestamps")]
    pub event_timestamps: Vec<i64>,
    #[serde(rename = "EventNames")]
    pub event_names: Vec<String>,
    #[serde(rename = "LinkTraceIds")]
    pub link_trace_ids: Vec<String>,
    #[serde(rename = "LinkSpanIds")]
    pub link_span_ids: Vec<String>,
    #[serde(rename = "LinkTraceStates")]
    pub link_trace_states: Vec<String>,
}
