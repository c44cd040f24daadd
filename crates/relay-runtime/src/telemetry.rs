use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use relay_cache::CacheTelemetrySnapshot;
use relay_providers::CacheTelemetry;
use relay_types::{EventEnvelope, EventType};

/// Aggregated view over all events of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTelemetry {
    pub dispatch_count: u64,
    pub approval_loops: u64,
    pub compaction_count: u64,
    pub compaction_prompt_tokens_before: u64,
    pub compaction_prompt_tokens_after: u64,
    pub events_by_type: HashMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    pub file_cache: CacheTelemetrySnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_cache: Option<CacheTelemetry>,
}

pub fn aggregate(events: &[EventEnvelope]) -> RunTelemetry {
    let mut telemetry = RunTelemetry::default();

    for event in events {
        *telemetry
            .events_by_type
            .entry(event.event_type.as_str().to_string())
            .or_insert(0) += 1;
        telemetry.last_event_at = Some(
            telemetry
                .last_event_at
                .map_or(event.occurred_at, |t| t.max(event.occurred_at)),
        );

        match event.event_type {
            EventType::LlmRequest => {
                telemetry.dispatch_count += 1;
                let applied = event
                    .payload
                    .get("compaction_applied")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if applied {
                    telemetry.compaction_count += 1;
                    telemetry.compaction_prompt_tokens_before += event
                        .payload
                        .get("prompt_tokens_before")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    telemetry.compaction_prompt_tokens_after += event
                        .payload
                        .get("prompt_tokens_after")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                }
            }
            EventType::LlmResponse => {
                let needs_changes = event
                    .payload
                    .get("assessment")
                    .and_then(|v| v.as_str())
                    .map(|v| v == "needs_changes")
                    .unwrap_or(false);
                if needs_changes {
                    telemetry.approval_loops += 1;
                }
            }
            _ => {}
        }
    }

    telemetry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType, sequence: u64, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            event_id: format!("e-{sequence}"),
            idempotency_key: format!("k-{sequence}"),
            partition_key: "run-1".to_string(),
            sequence,
            parent_event_id: None,
            occurred_at: Utc::now(),
            run_id: "run-1".to_string(),
            step_id: "1".to_string(),
            agent_id: "implementer".to_string(),
            event_type,
            payload,
            schema_version: "v2".to_string(),
        }
    }

    #[test]
    fn aggregates_dispatches_compactions_and_loops() {
        let events = vec![
            event(EventType::StateDelta, 1, json!({})),
            event(
                EventType::LlmRequest,
                2,
                json!({"compaction_applied": true, "prompt_tokens_before": 900, "prompt_tokens_after": 400}),
            ),
            event(EventType::LlmResponse, 3, json!({"status": "completed"})),
            event(EventType::LlmRequest, 4, json!({"compaction_applied": false})),
            event(EventType::LlmResponse, 5, json!({"assessment": "needs_changes"})),
        ];

        let telemetry = aggregate(&events);
        assert_eq!(telemetry.dispatch_count, 2);
        assert_eq!(telemetry.compaction_count, 1);
        assert_eq!(telemetry.compaction_prompt_tokens_before, 900);
        assert_eq!(telemetry.compaction_prompt_tokens_after, 400);
        assert_eq!(telemetry.approval_loops, 1);
        assert_eq!(telemetry.events_by_type["LLM_REQUEST"], 2);
        assert!(telemetry.last_event_at.is_some());
    }

    #[test]
    fn empty_run_aggregates_to_defaults() {
        let telemetry = aggregate(&[]);
        assert_eq!(telemetry.dispatch_count, 0);
        assert!(telemetry.last_event_at.is_none());
    }
}
