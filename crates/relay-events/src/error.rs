use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventStreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("replay failed at line {line}: {message}")]
    Replay { line: usize, message: String },

    #[error("invalid event draft: {0}")]
    InvalidDraft(String),

    #[error("event persistence failed: {0}")]
    Persist(String),
}

#[derive(Error, Debug)]
pub enum SnapshotStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot persistence failed: {0}")]
    Persist(String),
}

pub type Result<T, E = EventStreamError> = std::result::Result<T, E>;
