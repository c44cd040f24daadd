//! Prompt compilation for the dispatch runtime.
//!
//! Templates are ordered segment lists; compilation produces the full
//! prompt text plus two hashes. `stable_prefix_hash` covers stable
//! segments only, so provider prompt caches can key on it no matter what
//! the dynamic tail carries.

mod prefix;
mod reducer;
mod template;

pub use prefix::{compute_cache_key, PromptCacheKey};
pub use reducer::{reduce_history, MaskingConfig, Message, PairSide, ReducerConfig};
pub use template::{
    sha256_hex, CompiledPrompt, PromptError, PromptSegment, PromptTemplate, SegmentKind,
    TemplateRegistry,
};
