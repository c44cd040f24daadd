use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current envelope schema version stamped on every published event.
pub const EVENT_SCHEMA_VERSION: &str = "v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    LlmRequest,
    LlmResponse,
    BudgetDecision,
    InterceptorDecision,
    StateDelta,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::LlmRequest => "LLM_REQUEST",
            EventType::LlmResponse => "LLM_RESPONSE",
            EventType::BudgetDecision => "BUDGET_DECISION",
            EventType::InterceptorDecision => "INTERCEPTOR_DECISION",
            EventType::StateDelta => "STATE_DELTA",
            EventType::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A draft handed to `EventStream::publish`. The stream fills in the event
/// id, per-partition sequence, producer timestamp, and schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub idempotency_key: String,
    pub partition_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    pub run_id: String,
    #[serde(default)]
    pub step_id: String,
    #[serde(default)]
    pub agent_id: String,
    pub event_type: EventType,
    pub payload: Value,
}

impl EventDraft {
    /// Draft on the run's own partition with a fresh idempotency key.
    pub fn new(run_id: impl Into<String>, event_type: EventType, payload: Value) -> Self {
        let run_id = run_id.into();
        Self {
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            partition_key: run_id.clone(),
            parent_event_id: None,
            run_id,
            step_id: String::new(),
            agent_id: String::new(),
            event_type,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub idempotency_key: String,
    pub partition_key: String,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub run_id: String,
    #[serde(default)]
    pub step_id: String,
    #[serde(default)]
    pub agent_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub schema_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_to_wire_names() {
        let v = serde_json::to_string(&EventType::LlmRequest).unwrap();
        assert_eq!(v, "\"LLM_REQUEST\"");
        let back: EventType = serde_json::from_str("\"BUDGET_DECISION\"").unwrap();
        assert_eq!(back, EventType::BudgetDecision);
    }

    #[test]
    fn draft_constructor_partitions_by_run_id() {
        let draft = EventDraft::new("run-1", EventType::StateDelta, serde_json::json!({}));
        assert_eq!(draft.partition_key, "run-1");
        assert_eq!(draft.run_id, "run-1");
        assert!(!draft.idempotency_key.is_empty());
        let second = EventDraft::new("run-1", EventType::StateDelta, serde_json::json!({}));
        assert_ne!(draft.idempotency_key, second.idempotency_key);
    }
}
