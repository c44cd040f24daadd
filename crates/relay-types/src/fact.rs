use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactTag {
    FileChange,
    Convention,
    Decision,
    Error,
    Dependency,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactRole {
    Implementer,
    Reviewer,
}

/// A subject/relation/object triple carried between tasks in a run.
///
/// `valid_to == None` means the fact is currently valid. Adding a new fact
/// with the same (subject, relation) invalidates prior valid facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFact {
    pub id: String,
    pub subject: String,
    pub relation: String,
    pub object: String,
    pub tags: Vec<FactTag>,
    pub valid_from: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    pub source_task_id: String,
    pub source_role: FactRole,
    pub confidence: f64,
}

impl SessionFact {
    pub fn is_valid(&self) -> bool {
        self.valid_to.is_none()
    }
}
