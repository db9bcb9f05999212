use std::collections::HashMap;
use std::sync::Arc;

use clickhouse::test::{handlers, status, Mock};
use clickhouse::Row;
use envconfig::Envconfig;
use serde::Serialize;

use ci_capture::cache::DedupCache;
use ci_capture::config::{Config, WritePolicy};
use ci_capture::error::RecordError;
use ci_capture::model::{
    Job, MergeRequestNoteEvent, Pipeline, ResourceSpans, ScopeSpans, Section, Span, SpanRow,
    TracePayload,
};
use ci_capture::recorder::Recorder;
use ci_capture::store::{warmup, StoreClient};

fn store_for(mock: &Mock) -> StoreClient {
    let mut env = HashMap::new();
    env.insert("CLICKHOUSE_URL".to_string(), mock.url().to_string());
    let config = Config::init_from_hashmap(&env).unwrap();
    StoreClient::new(&config)
}

fn recorder_for(mock: &Mock, policy: WritePolicy) -> Recorder {
    Recorder::new(store_for(mock), Arc::new(DedupCache::new()), policy)
}

fn job(id: i64, pipeline_id: i64) -> Job {
    Job {
        id,
        pipeline_id,
        name: format!("job-{id}"),
        status: "success".to_string(),
        ..Job::default()
    }
}

fn pipeline(id: i64, updated_at: f64) -> Pipeline {
    Pipeline {
        id,
        updated_at,
        status: "success".to_string(),
        ..Pipeline::default()
    }
}

fn section(id: i64, job_id: i64) -> Section {
    Section {
        id,
        job_id,
        name: format!("section-{id}"),
        ..Section::default()
    }
}

fn trace_payload(trace_id: &str, span_id: &str) -> TracePayload {
    TracePayload {
        resource_spans: vec![ResourceSpans {
            resource_attributes: HashMap::from([(
                "service.name".to_string(),
                "runner".to_string(),
            )]),
            scope_spans: vec![ScopeSpans {
                scope_name: "ci".to_string(),
                scope_version: "1".to_string(),
                spans: vec![Span {
                    trace_id: trace_id.to_string(),
                    span_id: span_id.to_string(),
                    name: "compile".to_string(),
                    start_time_unix_nano: 1_700_000_000_000_000_000,
                    end_time_unix_nano: 1_700_000_001_000_000_000,
                    ..Span::default()
                }],
            }],
        }],
    }
}

#[tokio::test]
async fn duplicate_batches_never_reach_the_store() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::default());

    let recording = mock.add(handlers::record());
    let recorded = recorder
        .record_jobs(vec![job(1, 10), job(2, 10)])
        .await
        .unwrap();
    assert_eq!(recorded, 2);

    let written: Vec<Job> = recording.collect().await;
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].id, 1);

    // The repeat is answered from the cache alone; no handler is queued,
    // so any network call here would fail the test.
    let recorded = recorder
        .record_jobs(vec![job(1, 10), job(2, 10)])
        .await
        .unwrap();
    assert_eq!(recorded, 0);
}

#[tokio::test]
async fn jobs_without_a_pipeline_are_rejected_but_do_not_poison_the_batch() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::default());

    let recording = mock.add(handlers::record());
    let result = recorder.record_jobs(vec![job(1, 10), job(2, 0)]).await;

    match result {
        Err(RecordError::Rejected { recorded, errors }) => {
            assert_eq!(recorded, 1);
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].id, "2");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let written: Vec<Job> = recording.collect().await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].id, 1);
}

#[tokio::test]
async fn pipelines_are_rerecorded_when_updated_at_advances() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::default());

    let recording = mock.add(handlers::record());
    let recorded = recorder
        .record_pipelines(vec![pipeline(1053344116, 1698520756.0)])
        .await
        .unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<Pipeline> = recording.collect().await;
    assert_eq!(written.len(), 1);

    // Same version again: dropped without a store call.
    let recorded = recorder
        .record_pipelines(vec![pipeline(1053344116, 1698520756.0)])
        .await
        .unwrap();
    assert_eq!(recorded, 0);

    // A newer version goes through.
    let recording = mock.add(handlers::record());
    let recorded = recorder
        .record_pipelines(vec![pipeline(1053344116, 1709539234.0)])
        .await
        .unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<Pipeline> = recording.collect().await;
    assert_eq!(written[0].updated_at, 1709539234.0);
}

fn note_event(id: i64, mergerequest_id: i64, updated_at: f64) -> MergeRequestNoteEvent {
    MergeRequestNoteEvent {
        id,
        mergerequest_id,
        updated_at,
        note_type: "DiscussionNote".to_string(),
        ..MergeRequestNoteEvent::default()
    }
}

#[tokio::test]
async fn note_events_are_rerecorded_when_resolved() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::default());

    let recording = mock.add(handlers::record());
    let recorded = recorder
        .record_merge_request_note_events(vec![note_event(900, 55, 1708897133.0)])
        .await
        .unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<MergeRequestNoteEvent> = recording.collect().await;
    assert_eq!(written[0].id, 900);

    // Unchanged note: answered from the cache.
    let recorded = recorder
        .record_merge_request_note_events(vec![note_event(900, 55, 1708897133.0)])
        .await
        .unwrap();
    assert_eq!(recorded, 0);

    // Resolving the note bumps updated_at and re-records it.
    let recording = mock.add(handlers::record());
    let mut resolved = note_event(900, 55, 1709539234.0);
    resolved.resolved = true;
    let recorded = recorder
        .record_merge_request_note_events(vec![resolved])
        .await
        .unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<MergeRequestNoteEvent> = recording.collect().await;
    assert!(written[0].resolved);
}

#[tokio::test]
async fn note_events_without_a_merge_request_are_rejected() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::default());

    let recording = mock.add(handlers::record());
    let result = recorder
        .record_merge_request_note_events(vec![
            note_event(900, 55, 1708897133.0),
            note_event(901, 0, 1708897133.0),
        ])
        .await;

    match result {
        Err(RecordError::Rejected { recorded, errors }) => {
            assert_eq!(recorded, 1);
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].id, "901");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let written: Vec<MergeRequestNoteEvent> = recording.collect().await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].id, 900);
}

#[tokio::test]
async fn sections_deduplicate_at_job_granularity() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::default());

    let recording = mock.add(handlers::record());
    let recorded = recorder
        .record_sections(vec![section(1, 100), section(2, 100)])
        .await
        .unwrap();
    assert_eq!(recorded, 2);
    let written: Vec<Section> = recording.collect().await;
    assert_eq!(written.len(), 2);

    // Job 100 is known, so even a section id never seen before is dropped.
    // Only job 200's sections survive.
    let recording = mock.add(handlers::record());
    let recorded = recorder
        .record_sections(vec![section(3, 100), section(4, 200)])
        .await
        .unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<Section> = recording.collect().await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].id, 4);
}

#[tokio::test]
async fn empty_trace_payloads_short_circuit() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::default());

    // No handler queued: the call must not touch the store.
    let recorded = recorder
        .record_traces(vec![TracePayload::default()])
        .await
        .unwrap();
    assert_eq!(recorded, 0);
}

#[tokio::test]
async fn trace_spans_flatten_and_deduplicate_by_span_key() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::default());

    let recording = mock.add(handlers::record());
    let recorded = recorder
        .record_traces(vec![trace_payload("t1", "s1")])
        .await
        .unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<SpanRow> = recording.collect().await;
    assert_eq!(written[0].trace_id, "t1");
    assert_eq!(written[0].service_name, "runner");
    assert_eq!(written[0].duration, 1_000_000_000);

    // Same (trace, span) key again: nothing to write.
    let recorded = recorder
        .record_traces(vec![trace_payload("t1", "s1")])
        .await
        .unwrap();
    assert_eq!(recorded, 0);

    // A different span of the same trace is new.
    let recording = mock.add(handlers::record());
    let recorded = recorder
        .record_traces(vec![trace_payload("t1", "s2")])
        .await
        .unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<SpanRow> = recording.collect().await;
    assert_eq!(written[0].span_id, "s2");
}

#[tokio::test]
async fn mutate_after_confirm_still_suppresses_repeats_after_success() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::MutateAfterConfirm);

    let recording = mock.add(handlers::record());
    let recorded = recorder.record_jobs(vec![job(7, 70)]).await.unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<Job> = recording.collect().await;
    assert_eq!(written.len(), 1);

    // The successful send committed the decision.
    let recorded = recorder.record_jobs(vec![job(7, 70)]).await.unwrap();
    assert_eq!(recorded, 0);
}

#[tokio::test]
async fn mutate_before_send_keeps_keys_cached_after_a_failed_send() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::MutateBeforeSend);

    mock.add(handlers::failure(status::INTERNAL_SERVER_ERROR));
    let result = recorder.record_jobs(vec![job(1, 10)]).await;
    assert!(result.is_err());

    // The decision was taken before the send and is not rolled back, so the
    // retry is skipped without a store call (no handler is queued).
    let recorded = recorder.record_jobs(vec![job(1, 10)]).await.unwrap();
    assert_eq!(recorded, 0);
}

#[tokio::test]
async fn mutate_after_confirm_forgets_keys_after_a_failed_send() {
    let mock = Mock::new();
    let recorder = recorder_for(&mock, WritePolicy::MutateAfterConfirm);

    mock.add(handlers::failure(status::INTERNAL_SERVER_ERROR));
    let result = recorder.record_jobs(vec![job(1, 10)]).await;
    assert!(result.is_err());

    // Nothing was committed, so the retry writes the batch in full.
    let recording = mock.add(handlers::record());
    let recorded = recorder.record_jobs(vec![job(1, 10)]).await.unwrap();
    assert_eq!(recorded, 1);
    let written: Vec<Job> = recording.collect().await;
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].id, 1);
}

#[derive(Row, Serialize)]
struct VersionRow {
    id: i64,
    updated_at: f64,
}

#[derive(Row, Serialize)]
struct IntIdRow {
    id: i64,
}

#[derive(Row, Serialize)]
struct StringIdRow {
    id: String,
}

#[derive(Row, Serialize)]
struct SpanKeyRow {
    trace_id: String,
    span_id: String,
}

#[tokio::test]
async fn warm_up_reproduces_persisted_decisions() {
    let mock = Mock::new();
    let store = store_for(&mock);
    let cache = Arc::new(DedupCache::new());

    // One provide handler per scan, in warm-up order.
    mock.add(handlers::provide(vec![VersionRow {
        id: 1053344116,
        updated_at: 1698520756.0,
    }]));
    mock.add(handlers::provide(Vec::<VersionRow>::new())); // merge requests
    mock.add(handlers::provide(Vec::<VersionRow>::new())); // note events
    mock.add(handlers::provide(Vec::<VersionRow>::new())); // projects
    mock.add(handlers::provide(vec![IntIdRow { id: 42 }])); // jobs
    mock.add(handlers::provide(Vec::<IntIdRow>::new())); // bridges
    mock.add(handlers::provide(vec![StringIdRow {
        id: "report-1".to_string(),
    }])); // test reports
    mock.add(handlers::provide(Vec::<StringIdRow>::new())); // test suites
    mock.add(handlers::provide(Vec::<StringIdRow>::new())); // coverage reports
    mock.add(handlers::provide(Vec::<IntIdRow>::new())); // deployments
    mock.add(handlers::provide(vec![IntIdRow { id: 6252785467 }])); // sections
    mock.add(handlers::provide(Vec::<StringIdRow>::new())); // test cases
    mock.add(handlers::provide(Vec::<IntIdRow>::new())); // metrics
    mock.add(handlers::provide(vec![SpanKeyRow {
        trace_id: "t1".to_string(),
        span_id: "s1".to_string(),
    }]));

    warmup::warm_up(&store, &cache).await.unwrap();

    // Persisted identifiers answer as duplicates, unseen ones as new.
    assert_eq!(
        cache.decide_pipelines(&[(1053344116, 1698520756.0)])[&1053344116],
        false
    );
    assert_eq!(
        cache.decide_pipelines(&[(1053344116, 1709539234.0)])[&1053344116],
        true
    );
    assert_eq!(cache.decide_jobs(&[42, 43]), vec![false, true]);
    assert_eq!(
        cache.decide_test_reports(&["report-1".to_string()]),
        vec![false]
    );
    assert_eq!(cache.decide_sections(&[6252785467])[&6252785467], false);
    assert_eq!(
        cache.decide_trace_spans(&[("t1".to_string(), "s1".to_string())]),
        vec![false]
    );
}
