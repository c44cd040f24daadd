//! Request-side policy for the dispatch runtime: the budget guard filters
//! model candidates against spend caps, and the interception chain runs
//! registered transformers over outgoing requests under strict time
//! budgets.

mod chain;
mod guard;

pub use chain::{
    run_chain, ChainConfig, ChainError, ChainOutcome, Criticality, Hook, HookDecision,
    Interceptor, InterceptorReport,
};
pub use guard::{filter_candidates, reason};
