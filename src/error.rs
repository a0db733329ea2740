use std::path::PathBuf;

use crate::services::ServiceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("corrupt cache record {}: {reason}", path.display())]
    CacheCorruption { path: PathBuf, reason: String },

    #[error("corrupt index checkpoint {}: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error(
        "keyword index needs a full rebuild ({rejected} checkpoint(s) failed verification)"
    )]
    RebuildRequired { rejected: usize },

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("circuit open for {service}, failing fast")]
    CircuitOpen { service: String },

    #[error(
        "resource budget exhausted: requested {requested} bytes, {available} available"
    )]
    ResourceExhausted { requested: u64, available: u64 },

    #[error("no retrieval source is available")]
    NoRetrievalSource,

    #[error("session violation: key owned by {found} read from {expected}")]
    SessionViolation { expected: String, found: String },

    #[error("background worker is shutting down")]
    ShuttingDown,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
