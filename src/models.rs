use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type JobId = u64;
pub type WorkerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "SHA-1")]
    Sha1,
    #[serde(rename = "SHA-256")]
    Sha256,
}

impl Algorithm {
    pub fn all() -> Vec<Algorithm> {
        vec![Algorithm::Md5, Algorithm::Sha1, Algorithm::Sha256]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Sha1 => "SHA-1",
            Algorithm::Sha256 => "SHA-256",
        }
    }

    /// Keeps the first occurrence of each algorithm, in request order.
    pub fn dedup(algorithms: &[Algorithm]) -> Vec<Algorithm> {
        let mut out = Vec::with_capacity(algorithms.len());
        for algorithm in algorithms {
            if !out.contains(algorithm) {
                out.push(*algorithm);
            }
        }
        out
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "MD5" => Ok(Algorithm::Md5),
            "SHA-1" | "SHA1" => Ok(Algorithm::Sha1),
            "SHA-256" | "SHA256" => Ok(Algorithm::Sha256),
            other => Err(format!("unsupported algorithm: {other}")),
        }
    }
}

/// Metadata snapshot of a file at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub path: String,
    pub size: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
}

/// Persisted digests for one path. `None` means "not computed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
}

impl FileRecord {
    pub fn empty(meta: &FileMeta) -> Self {
        Self {
            path: meta.path.clone(),
            name: meta.name.clone(),
            size: meta.size,
            last_modified: meta.last_modified,
            md5: None,
            sha1: None,
            sha256: None,
        }
    }

    pub fn digest(&self, algorithm: Algorithm) -> Option<&str> {
        match algorithm {
            Algorithm::Md5 => self.md5.as_deref(),
            Algorithm::Sha1 => self.sha1.as_deref(),
            Algorithm::Sha256 => self.sha256.as_deref(),
        }
    }

    pub fn set_digest(&mut self, algorithm: Algorithm, hex: String) {
        let slot = match algorithm {
            Algorithm::Md5 => &mut self.md5,
            Algorithm::Sha1 => &mut self.sha1,
            Algorithm::Sha256 => &mut self.sha256,
        };
        *slot = Some(hex);
    }

    /// True when the record describes the same size and modification time as `meta`.
    pub fn matches(&self, meta: &FileMeta) -> bool {
        self.size == meta.size && self.last_modified == meta.last_modified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Status only moves forward: pending, processing, then a terminal state.
    pub fn can_become(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Pending | JobStatus::Processing, JobStatus::Succeeded | JobStatus::Failed) => true,
            _ => false,
        }
    }
}

/// A unit of work. The file content capability travels separately, see `file_ops::FileHandle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashJob {
    pub id: JobId,
    pub file: FileMeta,
    pub status: JobStatus,
    pub algorithms: Vec<Algorithm>,
    pub processed_byte_count: u64,
    pub results: Option<Vec<String>>,
}

impl HashJob {
    pub fn new(id: JobId, file: FileMeta, algorithms: Vec<Algorithm>) -> Self {
        Self {
            id,
            file,
            status: JobStatus::Pending,
            algorithms,
            processed_byte_count: 0,
            results: None,
        }
    }
}
