use crate::models::WorkerId;
use std::path::PathBuf;
use thiserror::Error;

/// Structured failures of a hashing pass. These become `error` worker events.
#[derive(Error, Debug)]
pub enum HashError {
    #[error("Failed to open {name}: {source}")]
    Open {
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to read {name} after {offset} bytes: {source}")]
    Read {
        name: String,
        offset: u64,
        source: std::io::Error,
    },

    #[error("Hashing aborted")]
    Aborted,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Record store is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record store lock poisoned")]
    Poisoned,

    #[error("Record store task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("At least one algorithm must be requested")]
    NoAlgorithms,

    #[error("Hash pool has shut down")]
    Closed,

    #[error("Worker {0} is no longer running")]
    WorkerGone(WorkerId),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
