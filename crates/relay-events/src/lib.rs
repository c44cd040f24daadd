//! Durable event plumbing for the Relay runtime.
//!
//! Three pieces live here: the partitioned append-only [`EventStream`], the
//! revisioned [`SnapshotStore`], and the pure [`project`] function mapping
//! an event onto the previous run snapshot. The stream and store are
//! single-process durable structures; multi-process writers are out of
//! scope.

mod error;
mod projector;
mod snapshot_store;
mod stream;

pub use error::{EventStreamError, Result, SnapshotStoreError};
pub use projector::{project, SnapshotUpdate, PROJECTOR_VERSION};
pub use snapshot_store::{SnapshotStore, SnapshotStoreConfig, SNAPSHOT_FORMAT_VERSION};
pub use stream::{EventStream, EventStreamConfig};
