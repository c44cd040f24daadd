use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Blocked,
    Done,
    Failed,
}

impl RunStatus {
    /// `done` and `failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }
}

/// Highest sequence already reflected in a snapshot for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOffset {
    pub partition_key: String,
    pub sequence: u64,
}

/// Key/value fact carried on the run snapshot itself (distinct from
/// session facts, which live in the fact store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFact {
    pub k: String,
    pub v: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub channel: String,
    pub task_id: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenBudget {
    pub input_remaining: i64,
    pub output_remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    /// Starts at 1 and is strictly monotonic per run.
    pub revision: u64,
    pub projector_version: String,
    pub applied_offsets: Vec<AppliedOffset>,
    /// `"{run_id}:root"` for revision 1, else `"{run_id}:rev:{previous}"`.
    pub parent_config: String,
    #[serde(default)]
    pub pending_writes: Vec<PendingWrite>,
    pub status: RunStatus,
    pub goal: String,
    #[serde(default)]
    pub facts: Vec<RunFact>,
    #[serde(default)]
    pub token_budget: TokenBudget,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn applied_offset(&self, partition_key: &str) -> u64 {
        self.applied_offsets
            .iter()
            .find(|o| o.partition_key == partition_key)
            .map(|o| o.sequence)
            .unwrap_or(0)
    }

    pub fn fact(&self, key: &str) -> Option<&RunFact> {
        self.facts.iter().rev().find(|f| f.k == key)
    }
}
