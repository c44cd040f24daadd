use serde::{Deserialize, Serialize};

/// Implementer-reported task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Blocked,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestOutcome {
    pub command: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<Vec<String>>,
}

/// The implementer dispatch contract. Strict on the wire: unknown keys
/// fail validation and every non-optional field is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImplementerResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub summary: String,
    pub files_changed: Vec<String>,
    pub tests: Vec<TestOutcome>,
    pub follow_up_actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAssessment {
    Approved,
    NeedsChanges,
    Blocked,
}

impl ReviewAssessment {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewAssessment::Approved => "approved",
            ReviewAssessment::NeedsChanges => "needs_changes",
            ReviewAssessment::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Important,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewIssue {
    pub severity: IssueSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub message: String,
    pub fix: String,
}

/// The reviewer dispatch contract, strict like the implementer one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewerResult {
    pub task_id: String,
    pub assessment: ReviewAssessment,
    pub strengths: Vec<String>,
    pub issues: Vec<ReviewIssue>,
    pub required_fixes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implementer_contract_rejects_unknown_keys() {
        let raw = r#"{"task_id":"1","status":"completed","summary":"ok",
            "files_changed":[],"tests":[],"follow_up_actions":[],"extra":true}"#;
        assert!(serde_json::from_str::<ImplementerResult>(raw).is_err());
    }

    #[test]
    fn implementer_contract_requires_tests() {
        let raw = r#"{"task_id":"1","status":"completed","summary":"ok",
            "files_changed":[],"follow_up_actions":[]}"#;
        assert!(serde_json::from_str::<ImplementerResult>(raw).is_err());
    }

    #[test]
    fn reviewer_contract_parses_issue_severities() {
        let raw = r#"{"task_id":"1","assessment":"needs_changes","strengths":[],
            "issues":[{"severity":"critical","file":"src/a.rs","message":"m","fix":"f"}],
            "required_fixes":["f"]}"#;
        let parsed: ReviewerResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.assessment, ReviewAssessment::NeedsChanges);
        assert_eq!(parsed.issues[0].severity, IssueSeverity::Critical);
    }
}
