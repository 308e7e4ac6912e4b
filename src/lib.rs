//! Parallel file hashing with a fixed worker pool.
//!
//! Callers submit files to a [`pool::HashPool`]; a dispatcher task hands
//! each job to an idle [`worker::HashWorker`], which streams the file once
//! through every requested algorithm (MD5, SHA-1, SHA-256) and reports
//! progress. Digests are cached by path in a [`storage::RecordStore`] so an
//! unchanged file is never hashed twice for the same algorithm.

pub mod cache;
pub mod config;
pub mod error;
pub mod file_ops;
pub mod hashers;
pub mod logging;
pub mod models;
pub mod pool;
pub mod protocol;
pub mod storage;
pub mod worker;

pub use cache::{CacheLookup, DigestCache};
pub use config::PoolConfig;
pub use error::{ConfigError, HashError, PoolError, StoreError};
pub use file_ops::{FileHandle, FileSource, LocalFile};
pub use hashers::DigestEngine;
pub use models::{Algorithm, FileMeta, FileRecord, HashJob, JobId, JobStatus, WorkerId};
pub use pool::{HashPool, JobSnapshot, PoolEvent};
pub use storage::{JsonRecordStore, MemoryRecordStore, RecordStore};
