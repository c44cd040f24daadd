use thiserror::Error;

use relay_policy::InterceptorReport;
use relay_types::BudgetDecision;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("budget exceeded: {decision:?}")]
    BudgetExceeded { decision: Box<BudgetDecision> },

    #[error("request dropped by interceptor: {reason_code}")]
    InterceptorDropped {
        reason_code: String,
        reports: Vec<InterceptorReport>,
    },

    #[error(transparent)]
    Events(#[from] relay_events::EventStreamError),

    #[error(transparent)]
    Snapshots(#[from] relay_events::SnapshotStoreError),

    #[error(transparent)]
    Schema(#[from] relay_schema::SchemaError),

    #[error(transparent)]
    Prompt(#[from] relay_prompt::PromptError),

    #[error(transparent)]
    Provider(#[from] relay_providers::ProviderError),

    #[error(transparent)]
    Dispatch(#[from] relay_dispatch::DispatchError),

    #[error(transparent)]
    Cache(#[from] relay_cache::CacheError),

    #[error(transparent)]
    Chain(#[from] relay_policy::ChainError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
