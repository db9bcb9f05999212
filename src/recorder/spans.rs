//! Trace payload flattening.
//!
//! Payloads carry spans nested three levels deep (resource, scope, span).
//! The store wants one flat row per span, with events and links spread into
//! parallel arrays, so the recorder flattens before any cache decision.

use time::OffsetDateTime;

use crate::model::{SpanRow, TracePayload};

const SERVICE_NAME_KEY: &str = "service.name";

pub fn flatten(payloads: &[TracePayload]) -> Vec<SpanRow> {
    let mut rows = Vec::new();

    for payload in payloads {
        for resource in &payload.resource_spans {
            let service_name = resource
                .resource_attributes
                .get(SERVICE_NAME_KEY)
                .cloned()
                .unwrap_or_default();

            for scope in &resource.scope_spans {
                for span in &scope.spans {
                    let timestamp =
                        OffsetDateTime::from_unix_timestamp_nanos(span.start_time_unix_nano as i128)
                            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
                    let duration =
                        span.end_time_unix_nano.saturating_sub(span.start_time_unix_nano) as i64;

                    rows.push(SpanRow {
                        timestamp,
                        trace_id: span.trace_id.clone(),
                        span_id: span.span_id.clone(),
                        parent_span_id: span.parent_span_id.clone(),
                        trace_state: span.trace_state.clone(),
                        span_name: span.name.clone(),
                        span_kind: span.kind.clone(),
                        service_name: service_name.clone(),
                        resource_attributes: resource.resource_attributes.clone(),
                        scope_name: scope.scope_name.clone(),
                        scope_version: scope.scope_version.clone(),
                        span_attributes: span.attributes.clone(),
                        duration,
                        status_code: span.status_code.clone(),
                        status_message: span.status_message.clone(),
                        event_timestamps: span
                            .events
                            .iter()
                            .map(|e| e.time_unix_nano as i64)
                            .collect(),
                        event_names: span.events.iter().map(|e| e.name.clone()).collect(),
                        link_trace_ids: span.links.iter().map(|l| l.trace_id.clone()).collect(),
                        link_span_ids: span.links.iter().map(|l| l.span_id.clone()).collect(),
                        link_trace_states: span
                            .links
                            .iter()
                            .map(|l| l.trace_state.clone())
                            .collect(),
                    });
                }
            }
        }
    }

    rows
}
