use relay_types::{
    AppliedOffset, EventEnvelope, EventType, PendingWrite, RunFact, RunSnapshot, RunStatus,
    TokenBudget,
};

pub const PROJECTOR_VERSION: &str = "projector-v2";

/// Projection output handed to `SnapshotStore::upsert`. Carries the full
/// next image minus the store-owned fields (revision, parent config,
/// merged offsets, timestamps).
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub run_id: String,
    pub status: RunStatus,
    pub goal: String,
    pub facts: Vec<RunFact>,
    pub pending_writes: Vec<PendingWrite>,
    pub token_budget: TokenBudget,
    pub applied_offset: AppliedOffset,
    pub projector_version: String,
}

/// Pure, total map from (previous snapshot, event) to the next projection.
/// Never fails; unknown payload shapes still project.
pub fn project(previous: Option<&RunSnapshot>, event: &EventEnvelope) -> SnapshotUpdate {
    let status = match event.event_type {
        EventType::Error => RunStatus::Failed,
        EventType::BudgetDecision => {
            let denied = event
                .payload
                .get("decision")
                .and_then(|v| v.as_str())
                .map(|v| v == "deny")
                .unwrap_or(false);
            if denied {
                RunStatus::Blocked
            } else {
                RunStatus::Running
            }
        }
        EventType::LlmResponse => RunStatus::Done,
        _ => RunStatus::Running,
    };

    let mut facts = previous.map(|p| p.facts.clone()).unwrap_or_default();
    facts.push(RunFact {
        k: format!("event:{}", event.event_type.as_str().to_ascii_lowercase()),
        v: event.payload.to_string(),
        confidence: 1.0,
    });

    let pending_writes = vec![PendingWrite {
        channel: "runtime-events".to_string(),
        task_id: event.step_id.clone(),
        value: event.payload.clone(),
    }];

    SnapshotUpdate {
        run_id: event.run_id.clone(),
        status,
        goal: previous.map(|p| p.goal.clone()).unwrap_or_default(),
        facts,
        pending_writes,
        token_budget: previous
            .map(|p| p.token_budget)
            .unwrap_or_else(TokenBudget::default),
        applied_offset: AppliedOffset {
            partition_key: event.partition_key.clone(),
            sequence: event.sequence,
        },
        projector_version: PROJECTOR_VERSION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn envelope(event_type: EventType, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            event_id: "e-1".to_string(),
            idempotency_key: "k-1".to_string(),
            partition_key: "run-1".to_string(),
            sequence: 1,
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

    fn previous() -> RunSnapshot {
        RunSnapshot {
            run_id: "run-1".to_string(),
            revision: 2,
            projector_version: PROJECTOR_VERSION.to_string(),
            applied_offsets: Vec::new(),
            parent_config: "run-1:rev:1".to_string(),
            pending_writes: Vec::new(),
            status: RunStatus::Running,
            goal: "feat:1".to_string(),
            facts: vec![RunFact {
                k: "event:state_delta".to_string(),
                v: "{}".to_string(),
                confidence: 1.0,
            }],
            token_budget: TokenBudget {
                input_remaining: 100,
                output_remaining: 50,
            },
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn error_event_projects_failed() {
        let update = project(None, &envelope(EventType::Error, json!({})));
        assert_eq!(update.status, RunStatus::Failed);
    }

    #[test]
    fn budget_deny_projects_blocked_other_decisions_running() {
        let denied = project(
            None,
            &envelope(EventType::BudgetDecision, json!({"decision": "deny"})),
        );
        assert_eq!(denied.status, RunStatus::Blocked);
        let allowed = project(
            None,
            &envelope(EventType::BudgetDecision, json!({"decision": "allow"})),
        );
        assert_eq!(allowed.status, RunStatus::Running);
    }

    #[test]
    fn llm_response_projects_done() {
        let update = project(None, &envelope(EventType::LlmResponse, json!({})));
        assert_eq!(update.status, RunStatus::Done);
    }

    #[test]
    fn facts_append_and_inherit_goal_and_budget() {
        let prev = previous();
        let update = project(
            Some(&prev),
            &envelope(EventType::LlmRequest, json!({"role": "implementer"})),
        );
        assert_eq!(update.status, RunStatus::Running);
        assert_eq!(update.goal, "feat:1");
        assert_eq!(update.token_budget, prev.token_budget);
        assert_eq!(update.facts.len(), 2);
        assert_eq!(update.facts[1].k, "event:llm_request");
        assert!((update.facts[1].confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn pending_writes_replaced_with_single_entry() {
        let update = project(Some(&previous()), &envelope(EventType::StateDelta, json!({"a": 1})));
        assert_eq!(update.pending_writes.len(), 1);
        let write = &update.pending_writes[0];
        assert_eq!(write.channel, "runtime-events");
        assert_eq!(write.task_id, "1");
        assert_eq!(write.value, json!({"a": 1}));
    }

    #[test]
    fn applied_offset_copies_partition_and_sequence() {
        let update = project(None, &envelope(EventType::StateDelta, json!({})));
        assert_eq!(update.applied_offset.partition_key, "run-1");
        assert_eq!(update.applied_offset.sequence, 1);
    }
}
