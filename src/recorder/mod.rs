//! Insert orchestration.
//!
//! The recorder is the only writer. For each batch it asks the dedup cache
//! which records are new, writes the surviving rows to the entity's landing
//! table in one insert, and reports how many rows were recorded. Validation
//! rejections never abort the batch: the valid remainder is still written
//! and the rejections travel back inside `RecordError::Rejected`.
//!
//! The write policy decides when the cache learns about a batch. Under
//! `MutateBeforeSend` the decision call itself mutates the cache, before the
//! store has confirmed anything. Under `MutateAfterConfirm` the recorder
//! peeks first and commits the decisions only after the insert succeeded.

mod spans;

use std::sync::Arc;

use clickhouse::Row;
use metrics::counter;
use serde::Serialize;
use tracing::debug;

use crate::cache::{DedupCache, SpanKey};
use crate::config::WritePolicy;
use crate::error::{RecordError, RowError};
use crate::model::{
    Bridge, CoverageReport, Deployment, Job, MergeRequest, MergeRequestNoteEvent, Metric,
    Pipeline, Project, Section, SpanRow, TestCase, TestReport, TestSuite, TracePayload,
};
use crate::store::{schema, StoreClient};

/// One unit of work for the recorder, dispatched by entity class.
#[derive(Debug)]
pub enum RecordBatch {
    Pipelines(Vec<Pipeline>),
    Jobs(Vec<Job>),
    Bridges(Vec<Bridge>),
    Sections(Vec<Section>),
    TestReports(Vec<TestReport>),
    TestSuites(Vec<TestSuite>),
    TestCases(Vec<TestCase>),
    MergeRequests(Vec<MergeRequest>),
    MergeRequestNoteEvents(Vec<MergeRequestNoteEvent>),
    Metrics(Vec<Metric>),
    Projects(Vec<Project>),
    CoverageReports(Vec<CoverageReport>),
    Deployments(Vec<Deployment>),
    Traces(Vec<TracePayload>),
}

pub struct Recorder {
    store: StoreClient,
    cache: Arc<DedupCache>,
    write_policy: WritePolicy,
}

impl Recorder {
    pub fn new(store: StoreClient, cache: Arc<DedupCache>, write_policy: WritePolicy) -> Self {
        Self {
            store,
            cache,
            write_policy,
        }
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    pub async fn record(&self, batch: RecordBatch) -> Result<u64, RecordError> {
        match batch {
            RecordBatch::Pipelines(rows) => self.record_pipelines(rows).await,
            RecordBatch::Jobs(rows) => self.record_jobs(rows).await,
            RecordBatch::Bridges(rows) => self.record_bridges(rows).await,
            RecordBatch::Sections(rows) => self.record_sections(rows).await,
            RecordBatch::TestReports(rows) => self.record_test_reports(rows).await,
            RecordBatch::TestSuites(rows) => self.record_test_suites(rows).await,
            RecordBatch::TestCases(rows) => self.record_test_cases(rows).await,
            RecordBatch::MergeRequests(rows) => self.record_merge_requests(rows).await,
            RecordBatch::MergeRequestNoteEvents(rows) => {
                self.record_merge_request_note_events(rows).await
            }
            RecordBatch::Metrics(rows) => self.record_metrics(rows).await,
            RecordBatch::Projects(rows) => self.record_projects(rows).await,
            RecordBatch::CoverageReports(rows) => self.record_coverage_reports(rows).await,
            RecordBatch::Deployments(rows) => self.record_deployments(rows).await,
            RecordBatch::Traces(payloads) => self.record_traces(payloads).await,
        }
    }

    /// Writes the surviving rows and bumps the per-entity counters.
    /// An all-duplicate batch never reaches the network.
    async fn write_rows<T>(
        &self,
        entity: &'static str,
        table: &str,
        rows: &[T],
        skipped: usize,
    ) -> Result<u64, RecordError>
    where
        T: Row + Serialize,
    {
        counter!("recorder_received_total", "entity" => entity)
            .increment((rows.len() + skipped) as u64);
        counter!("recorder_duplicates_total", "entity" => entity).increment(skipped as u64);

        if rows.is_empty() {
            debug!(entity, skipped, "batch fully deduplicated");
            return Ok(0);
        }

        let landing = schema::landing(table);
        let recorded = self.store.insert_rows(&landing, rows).await?;
        counter!("recorder_records_total", "entity" => entity).increment(recorded);
        debug!(entity, recorded, skipped, "batch recorded");
        Ok(recorded)
    }

    fn finish(
        &self,
        entity: &'static str,
        recorded: u64,
        errors: Vec<RowError>,
    ) -> Result<u64, RecordError> {
        if errors.is_empty() {
            return Ok(recorded);
        }
        counter!("recorder_rejected_total", "entity" => entity).increment(errors.len() as u64);
        Err(RecordError::Rejected { recorded, errors })
    }

    pub async fn record_pipelines(&self, pipelines: Vec<Pipeline>) -> Result<u64, RecordError> {
        let pairs: Vec<(i64, f64)> = pipelines.iter().map(|p| (p.id, p.updated_at)).collect();
        let (decisions, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_pipelines(&pairs), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_pipelines(&pairs), true),
        };

        let (rows, skipped) = split_by(pipelines, |p| decisions[&p.id]);
        let recorded = self
            .write_rows("pipelines", schema::PIPELINES_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_pipelines(&pairs, &decisions);
        }
        Ok(recorded)
    }

    pub async fn record_merge_requests(
        &self,
        merge_requests: Vec<MergeRequest>,
    ) -> Result<u64, RecordError> {
        let pairs: Vec<(i64, f64)> = merge_requests
            .iter()
            .map(|mr| (mr.id, mr.updated_at))
            .collect();
        let (decisions, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_merge_requests(&pairs), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_merge_requests(&pairs), true),
        };

        let (rows, skipped) = split_by(merge_requests, |mr| decisions[&mr.id]);
        let recorded = self
            .write_rows("mergerequests", schema::MERGE_REQUESTS_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_merge_requests(&pairs, &decisions);
        }
        Ok(recorded)
    }

    /// Note events are versioned like their merge requests: resolving or
    /// editing a note bumps `updated_at` and re-records it.
    pub async fn record_merge_request_note_events(
        &self,
        events: Vec<MergeRequestNoteEvent>,
    ) -> Result<u64, RecordError> {
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(events.len());
        for event in events {
            if event.mergerequest_id == 0 {
                errors.push(RowError {
                    entity: "noteevent",
                    id: event.id.to_string(),
                    reason: "no merge request reference",
                });
                continue;
            }
            valid.push(event);
        }
        let events = valid;

        let pairs: Vec<(i64, f64)> = events.iter().map(|e| (e.id, e.updated_at)).collect();
        let (decisions, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => {
                (self.cache.decide_merge_request_note_events(&pairs), false)
            }
            WritePolicy::MutateAfterConfirm => {
                (self.cache.peek_merge_request_note_events(&pairs), true)
            }
        };

        let (rows, skipped) = split_by(events, |e| decisions[&e.id]);
        let recorded = self
            .write_rows(
                "mergerequest_noteevents",
                schema::MERGE_REQUEST_NOTE_EVENTS_TABLE,
                &rows,
                skipped,
            )
            .await?;
        if confirm {
            self.cache.commit_merge_request_note_events(&pairs, &decisions);
        }
        self.finish("mergerequest_noteevents", recorded, errors)
    }

    pub async fn record_projects(&self, projects: Vec<Project>) -> Result<u64, RecordError> {
        let pairs: Vec<(i64, f64)> = projects.iter().map(|p| (p.id, p.updated_at)).collect();
        let (decisions, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_projects(&pairs), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_projects(&pairs), true),
        };

        let (rows, skipped) = split_by(projects, |p| decisions[&p.id]);
        let recorded = self
            .write_rows("projects", schema::PROJECTS_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_projects(&pairs, &decisions);
        }
        Ok(recorded)
    }

    pub async fn record_jobs(&self, jobs: Vec<Job>) -> Result<u64, RecordError> {
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(jobs.len());
        for job in jobs {
            // A job must reference its pipeline or downstream joins break.
            if job.pipeline_id == 0 {
                errors.push(RowError {
                    entity: "job",
                    id: job.id.to_string(),
                    reason: "no pipeline reference",
                });
                continue;
            }
            valid.push(job);
        }

        let keys: Vec<i64> = valid.iter().map(|j| j.id).collect();
        let (mask, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_jobs(&keys), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_jobs(&keys), true),
        };

        let (rows, skipped) = split_masked(valid, &mask);
        let recorded = self
            .write_rows("jobs", schema::JOBS_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_jobs(&keys, &mask);
        }
        self.finish("jobs", recorded, errors)
    }

    pub async fn record_bridges(&self, bridges: Vec<Bridge>) -> Result<u64, RecordError> {
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(bridges.len());
        for bridge in bridges {
            if bridge.pipeline_id == 0 {
                errors.push(RowError {
                    entity: "bridge",
                    id: bridge.id.to_string(),
                    reason: "no pipeline reference",
                });
                continue;
            }
            valid.push(bridge);
        }

        let keys: Vec<i64> = valid.iter().map(|b| b.id).collect();
        let (mask, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_bridges(&keys), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_bridges(&keys), true),
        };

        let (rows, skipped) = split_masked(valid, &mask);
        let recorded = self
            .write_rows("bridges", schema::BRIDGES_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_bridges(&keys, &mask);
        }
        self.finish("bridges", recorded, errors)
    }

    pub async fn record_test_reports(
        &self,
        reports: Vec<TestReport>,
    ) -> Result<u64, RecordError> {
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(reports.len());
        for report in reports {
            if report.job_id == 0 {
                errors.push(RowError {
                    entity: "testreport",
                    id: report.id.clone(),
                    reason: "no job reference",
                });
                continue;
            }
            valid.push(report);
        }
        let reports = valid;

        let keys: Vec<String> = reports.iter().map(|r| r.id.clone()).collect();
        let (mask, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_test_reports(&keys), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_test_reports(&keys), true),
        };

        let (rows, skipped) = split_masked(reports, &mask);
        let recorded = self
            .write_rows("testreports", schema::TEST_REPORTS_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_test_reports(&keys, &mask);
        }
        self.finish("testreports", recorded, errors)
    }

    pub async fn record_test_suites(&self, suites: Vec<TestSuite>) -> Result<u64, RecordError> {
        let keys: Vec<String> = suites.iter().map(|s| s.id.clone()).collect();
        let (mask, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_test_suites(&keys), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_test_suites(&keys), true),
        };

        let (rows, skipped) = split_masked(suites, &mask);
        let recorded = self
            .write_rows("testsuites", schema::TEST_SUITES_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_test_suites(&keys, &mask);
        }
        Ok(recorded)
    }

    pub async fn record_coverage_reports(
        &self,
        reports: Vec<CoverageReport>,
    ) -> Result<u64, RecordError> {
        let keys: Vec<String> = reports.iter().map(|r| r.id.clone()).collect();
        let (mask, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_coverage_reports(&keys), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_coverage_reports(&keys), true),
        };

        let (rows, skipped) = split_masked(reports, &mask);
        let recorded = self
            .write_rows(
                "coverage_reports",
                schema::COVERAGE_REPORTS_TABLE,
                &rows,
                skipped,
            )
            .await?;
        if confirm {
            self.cache.commit_coverage_reports(&keys, &mask);
        }
        Ok(recorded)
    }

    pub async fn record_deployments(
        &self,
        deployments: Vec<Deployment>,
    ) -> Result<u64, RecordError> {
        let keys: Vec<i64> = deployments.iter().map(|d| d.id).collect();
        let (mask, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_deployments(&keys), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_deployments(&keys), true),
        };

        let (rows, skipped) = split_masked(deployments, &mask);
        let recorded = self
            .write_rows("deployments", schema::DEPLOYMENTS_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_deployments(&keys, &mask);
        }
        Ok(recorded)
    }

    /// Sections dedup at job granularity: a job's sections arrive as one
    /// immutable set, so seeing the job once is enough to skip the set.
    pub async fn record_sections(&self, sections: Vec<Section>) -> Result<u64, RecordError> {
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(sections.len());
        for section in sections {
            if section.job_id == 0 {
                errors.push(RowError {
                    entity: "section",
                    id: section.id.to_string(),
                    reason: "no job reference",
                });
                continue;
            }
            valid.push(section);
        }
        let sections = valid;

        let parents: Vec<i64> = sections.iter().map(|s| s.job_id).collect();
        let (decisions, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_sections(&parents), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_sections(&parents), true),
        };

        let (rows, skipped) = split_by(sections, |s| decisions[&s.job_id]);
        let recorded = self
            .write_rows("sections", schema::SECTIONS_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_sections(&parents, &decisions);
        }
        self.finish("sections", recorded, errors)
    }

    /// Test cases dedup at test suite granularity, same shape as sections.
    pub async fn record_test_cases(&self, cases: Vec<TestCase>) -> Result<u64, RecordError> {
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(cases.len());
        for case in cases {
            if case.testsuite_id.is_empty() {
                errors.push(RowError {
                    entity: "testcase",
                    id: case.id.clone(),
                    reason: "no test suite reference",
                });
                continue;
            }
            valid.push(case);
        }
        let cases = valid;

        let parents: Vec<String> = cases.iter().map(|c| c.testsuite_id.clone()).collect();
        let (decisions, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_test_cases(&parents), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_test_cases(&parents), true),
        };

        let (rows, skipped) = split_by(cases, |c| decisions[&c.testsuite_id]);
        let recorded = self
            .write_rows("testcases", schema::TEST_CASES_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_test_cases(&parents, &decisions);
        }
        self.finish("testcases", recorded, errors)
    }

    /// Log-embedded metrics dedup at job granularity.
    pub async fn record_metrics(&self, metrics: Vec<Metric>) -> Result<u64, RecordError> {
        let mut errors = Vec::new();
        let mut valid = Vec::with_capacity(metrics.len());
        for metric in metrics {
            if metric.job_id == 0 {
                errors.push(RowError {
                    entity: "metric",
                    id: metric.id.clone(),
                    reason: "no job reference",
                });
                continue;
            }
            valid.push(metric);
        }
        let metrics = valid;

        let parents: Vec<i64> = metrics.iter().map(|m| m.job_id).collect();
        let (decisions, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_metrics(&parents), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_metrics(&parents), true),
        };

        let (rows, skipped) = split_by(metrics, |m| decisions[&m.job_id]);
        let recorded = self
            .write_rows("metrics", schema::METRICS_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_metrics(&parents, &decisions);
        }
        self.finish("metrics", recorded, errors)
    }

    pub async fn record_traces(&self, payloads: Vec<TracePayload>) -> Result<u64, RecordError> {
        let flattened = spans::flatten(&payloads);
        // A payload without spans never touches the cache or the store.
        if flattened.is_empty() {
            return Ok(0);
        }

        let keys: Vec<SpanKey> = flattened
            .iter()
            .map(|s| (s.trace_id.clone(), s.span_id.clone()))
            .collect();
        let (mask, confirm) = match self.write_policy {
            WritePolicy::MutateBeforeSend => (self.cache.decide_trace_spans(&keys), false),
            WritePolicy::MutateAfterConfirm => (self.cache.peek_trace_spans(&keys), true),
        };

        let (rows, skipped): (Vec<SpanRow>, usize) = split_masked(flattened, &mask);
        let recorded = self
            .write_rows("traces", schema::TRACE_SPANS_TABLE, &rows, skipped)
            .await?;
        if confirm {
            self.cache.commit_trace_spans(&keys, &mask);
        }
        Ok(recorded)
    }
}

/// Keeps the rows whose mask entry is true; returns the kept rows and how
/// many were dropped as duplicates.
fn split_masked<T>(rows: Vec<T>, mask: &[bool]) -> (Vec<T>, usize) {
    let mut kept = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for (row, new) in rows.into_iter().zip(mask) {
        if *new {
            kept.push(row);
        } else {
            skipped += 1;
        }
    }
    (kept, skipped)
}

fn split_by<T>(rows: Vec<T>, keep: impl Fn(&T) -> bool) -> (Vec<T>, usize) {
    let mut kept = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        if keep(&row) {
            kept.push(row);
        } else {
            skipped += 1;
        }
    }
    (kept, skipped)
}
