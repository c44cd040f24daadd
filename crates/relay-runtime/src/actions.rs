use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use relay_types::AgentRole;

/// Error codes surfaced in `ActionResponse.data.error_code`.
pub mod error_code {
    pub const RUN_NOT_FOUND: &str = "run_not_found";
    pub const MISSING_TASK_PROMPT: &str = "missing_task_prompt";
    pub const DISPATCH_OUTPUT_MISSING: &str = "dispatch_output_missing";
    pub const SCHEMA_INVALID: &str = "schema_invalid";
    pub const OUTPUT_TOKEN_BUDGET_EXCEEDED: &str = "output_token_budget_exceeded";
    pub const DISPATCH_EXECUTION_FAILED: &str = "dispatch_execution_failed";
    pub const BUDGET_DENIED: &str = "budget_denied";
    pub const BUDGET_QUEUED: &str = "budget_queued";
    pub const INTERCEPTOR_DROPPED: &str = "interceptor_dropped";
    pub const PROVIDER_NOT_CONFIGURED: &str = "provider_not_configured";
    pub const IO_ERROR: &str = "io_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// The single entry point's request surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    InitRun {
        run_id: String,
        spec_name: String,
        task_id: String,
    },
    CompilePrompt {
        run_id: String,
        role: AgentRole,
        task_id: String,
        #[serde(default)]
        task_prompt: Option<String>,
        max_output_tokens: u64,
        #[serde(default)]
        compaction_auto: bool,
    },
    IngestOutput {
        run_id: String,
        role: AgentRole,
        task_id: String,
        #[serde(default)]
        output_content: Option<String>,
        #[serde(default)]
        output_file_path: Option<String>,
        #[serde(default)]
        max_output_tokens: Option<u64>,
    },
    DispatchAndIngest {
        run_id: String,
        role: AgentRole,
        task_id: String,
        #[serde(default)]
        task_prompt: Option<String>,
        max_output_tokens: u64,
        #[serde(default)]
        compaction_auto: bool,
    },
    GetSnapshot {
        run_id: String,
    },
    GetTelemetry {
        run_id: String,
    },
}

/// Deterministic response envelope for every action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
    pub data: Value,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn fail(message: impl Into<String>, error_code: &str, mut data: Value) -> Self {
        if !data.is_object() {
            data = json!({});
        }
        data["error_code"] = json!(error_code);
        Self {
            success: false,
            message: message.into(),
            data,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.data.get("error_code").and_then(Value::as_str)
    }

    pub fn next_action(&self) -> Option<&str> {
        self.data.get("next_action").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    DispatchReviewer,
    FinalizeTask,
    RetryImplementer,
    RetryImplementerWithConstraints,
    DispatchImplementerFixes,
    HaltReviewerBlocked,
    HaltReviewLoop,
    HaltStalled,
    RetryOnceSchemaInvalid,
    HaltSchemaInvalidTerminal,
    DispatchExecutionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideMode {
    Full,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStage {
    None,
    ExamplesDropped,
    TaskTrimmed,
    DeltaReduced,
    FloorReached,
}

/// Prior-turn context appended to the prompt's dynamic tail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaPacket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts: Vec<DeltaFact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaFact {
    pub subject: String,
    pub relation: String,
    pub object: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileOutcome {
    pub prompt: String,
    pub stable_prefix_hash: String,
    pub full_prompt_hash: String,
    pub guide_mode: GuideMode,
    pub guide_cache_key: String,
    pub delta_packet: DeltaPacket,
    pub compaction_applied: bool,
    pub compaction_stage: CompactionStage,
    pub prompt_tokens_before: usize,
    pub prompt_tokens_after: usize,
    pub prompt_token_budget: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_requests_parse_from_tagged_json() {
        let raw = r#"{"action":"init_run","run_id":"r1","spec_name":"feat","task_id":"1"}"#;
        let parsed: ActionRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, ActionRequest::InitRun { .. }));

        let raw = r#"{"action":"compile_prompt","run_id":"r1","role":"implementer",
            "task_id":"1","task_prompt":"Implement X","max_output_tokens":500}"#;
        let parsed: ActionRequest = serde_json::from_str(raw).unwrap();
        match parsed {
            ActionRequest::CompilePrompt {
                role,
                compaction_auto,
                ..
            } => {
                assert_eq!(role, AgentRole::Implementer);
                assert!(!compaction_auto);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn next_actions_serialize_to_snake_case() {
        assert_eq!(
            serde_json::to_value(NextAction::RetryOnceSchemaInvalid).unwrap(),
            json!("retry_once_schema_invalid")
        );
        assert_eq!(
            serde_json::to_value(NextAction::HaltSchemaInvalidTerminal).unwrap(),
            json!("halt_schema_invalid_terminal")
        );
    }

    #[test]
    fn fail_responses_carry_the_error_code() {
        let response = ActionResponse::fail("bad", error_code::SCHEMA_INVALID, json!({"x": 1}));
        assert!(!response.success);
        assert_eq!(response.error_code(), Some("schema_invalid"));
        assert_eq!(response.data["x"], json!(1));
    }
}
