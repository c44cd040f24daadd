use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relay_policy::{ChainConfig, Interceptor};
use relay_providers::EnvConfig;
use relay_types::{BudgetPolicy, ModelCandidate};

/// Every tunable of the runtime in one place. Defaults match the
/// documented behavior; tests override individual fields.
#[derive(Debug, Clone)]
pub struct RuntimePolicy {
    /// In-memory events kept per partition.
    pub event_retention: usize,
    pub idempotency_cap: usize,
    pub snapshot_debounce: Duration,
    /// Valid session facts kept per run.
    pub max_session_facts: usize,
    /// Retriever bounds used when compiling delta packets.
    pub retriever_max_facts: usize,
    pub retriever_max_tokens: usize,
    pub chars_per_token: usize,
    pub chain: ChainConfig,
    /// Token budget applied to compiled prompts.
    pub prompt_token_budget: usize,
    /// Task prompt bound applied at the `task_trimmed` compaction stage.
    pub task_trim_chars: usize,
    /// Consecutive reviewer `needs_changes` → implementer cycles allowed
    /// per task before halting.
    pub review_loop_threshold: u32,
    /// Schema-valid implementer attempts allowed per task without
    /// advancing past `needs_changes`.
    pub stalled_threshold: u32,
    pub file_cache_max_entries: usize,
    /// Reviewer phase enabled for this workflow.
    pub reviewer_enabled: bool,
    /// Budget guard inputs; an empty candidate list disables the guard.
    pub budget_policy: BudgetPolicy,
    pub candidates: Vec<ModelCandidate>,
    /// Prompt-cache retention hint passed to provider adapters.
    pub cache_retention: Option<String>,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            event_retention: 2000,
            idempotency_cap: 10_000,
            snapshot_debounce: Duration::from_millis(35),
            max_session_facts: 500,
            retriever_max_facts: 10,
            retriever_max_tokens: 600,
            chars_per_token: 4,
            chain: ChainConfig::default(),
            prompt_token_budget: 12_000,
            task_trim_chars: 2_000,
            review_loop_threshold: 3,
            stalled_threshold: 5,
            file_cache_max_entries: 256,
            reviewer_enabled: true,
            budget_policy: BudgetPolicy::default(),
            candidates: Vec::new(),
            cache_retention: Some("24h".to_string()),
        }
    }
}

/// Wiring inputs for `DispatchRuntime::new`.
pub struct RuntimeConfig {
    pub global_dir: PathBuf,
    pub project_path: PathBuf,
    pub policy: RuntimePolicy,
    pub env: EnvConfig,
    pub interceptors: Vec<Arc<dyn Interceptor>>,
}

impl RuntimeConfig {
    pub fn new(global_dir: impl Into<PathBuf>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            global_dir: global_dir.into(),
            project_path: project_path.into(),
            policy: RuntimePolicy::default(),
            env: EnvConfig::default(),
            interceptors: Vec::new(),
        }
    }
}

/// Coarse `chars / 4` token estimate used across the runtime.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let policy = RuntimePolicy::default();
        assert_eq!(policy.event_retention, 2000);
        assert_eq!(policy.max_session_facts, 500);
        assert_eq!(policy.snapshot_debounce, Duration::from_millis(35));
        assert_eq!(policy.review_loop_threshold, 3);
        assert_eq!(policy.stalled_threshold, 5);
        assert_eq!(policy.chars_per_token, 4);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
