//! Carryover context between tasks in a run.
//!
//! Facts are subject/relation/object triples extracted from dispatch
//! results, stored in a bounded in-memory arena, and retrieved by keyword
//! overlap under a token budget when the next prompt is compiled.

mod extractor;
mod retriever;
mod store;

pub use extractor::{clip, extract_from_implementer, extract_from_reviewer, fact_id};
pub use retriever::{retrieve, RetrievalQuery};
pub use store::{CompactionOutcome, FactStoreConfig, SessionFactStore};
