//! The provider surface of the dispatch runtime.
//!
//! Providers form a closed set (`claude`, `codex`, `gemini`, `opencode`)
//! dispatched as enum variants behind a fixed interface: command
//! composition, prompt-cache hints, and telemetry extraction. Routing maps
//! classifier output onto that set with tier escalation.

mod cache;
mod catalog;
mod classifier;
mod env;
mod routing;

pub use cache::{
    cache_adapter_for, CacheMutation, CacheRequest, CacheTelemetry, ProviderCacheAdapter,
};
pub use catalog::{ProviderCatalog, ReasoningEffort};
pub use classifier::{classify, ClassifierInput, CLASSIFIER_ID};
pub use env::{
    is_truthy, ContextDiscipline, EnvConfig, ProviderError, RoleOverride, ENV_DISCIPLINE,
    ENV_DISPATCH_RUNTIME_V2, ENV_IMPLEMENTER, ENV_REVIEWER,
};
pub use routing::RoutingTable;
