use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub model_id: String,
    pub model_name: String,
    /// Cost estimate per 1k input tokens.
    pub input_cost_per_1k: f64,
    /// Cost estimate per 1k output tokens.
    pub output_cost_per_1k: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_request_cap: Option<f64>,
    #[serde(default)]
    pub per_model_caps: HashMap<String, f64>,
    #[serde(default)]
    pub allowed_tags: Vec<String>,
    #[serde(default)]
    pub denied_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_cap: Option<f64>,
    #[serde(default)]
    pub allow_emergency_degrade: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetVerdict {
    Allow,
    Deny,
    Degrade,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub verdict: BudgetVerdict,
    pub reason_codes: Vec<String>,
    pub candidates_before: usize,
    pub candidates_after: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRequest {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub interactive: bool,
}
