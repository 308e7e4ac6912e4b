//! Worker message protocol.
//!
//! Commands flow dispatcher -> worker, events flow worker -> dispatcher. The
//! JSON shapes are fixed so every worker in a pool speaks the same protocol:
//!
//! - `{"command":"init","id":..}` | `{"command":"hash","job":..}` | `{"command":"terminate"}`
//! - `{"type":"hashing",..}` | `{"type":"hashed",..}` | `{"type":"error",..}`

use serde::{Deserialize, Serialize};

use crate::file_ops::FileHandle;
use crate::models::{Algorithm, HashJob, JobId, WorkerId};

/// Commands received by a worker.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum WorkerCommand {
    Init {
        id: WorkerId,
    },
    Hash {
        job: HashJob,
        /// Content handle, moved into the worker. Never serialized.
        #[serde(skip)]
        source: Option<FileHandle>,
    },
    Terminate,
}

/// Events emitted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerEvent {
    #[serde(rename_all = "camelCase")]
    Hashing {
        worker_id: WorkerId,
        job_id: JobId,
        processed_byte_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    Hashed {
        worker_id: WorkerId,
        job_id: JobId,
        algorithms: Vec<Algorithm>,
        results: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        worker_id: WorkerId,
        job_id: JobId,
        error_message: String,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerEvent::Hashing { worker_id, .. }
            | WorkerEvent::Hashed { worker_id, .. }
            | WorkerEvent::Error { worker_id, .. } => *worker_id,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            WorkerEvent::Hashing { job_id, .. }
            | WorkerEvent::Hashed { job_id, .. }
            | WorkerEvent::Error { job_id, .. } => *job_id,
        }
    }
}

/// Defect-class failure reported outside the worker protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub worker_id: WorkerId,
    pub job_id: Option<JobId>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileMeta;
    use chrono::DateTime;
    use serde_json::json;

    #[test]
    fn init_and_terminate_commands_are_tagged() {
        let init = serde_json::to_value(WorkerCommand::Init { id: 3 }).unwrap();
        assert_eq!(init, json!({"command": "init", "id": 3}));

        let terminate = serde_json::to_value(WorkerCommand::Terminate).unwrap();
        assert_eq!(terminate, json!({"command": "terminate"}));
    }

    #[test]
    fn hash_command_carries_job_without_handle() {
        let file = FileMeta {
            name: "a".to_string(),
            path: "/a".to_string(),
            size: 4,
            last_modified: DateTime::from_timestamp_millis(1000).unwrap(),
        };
        let job = HashJob::new(9, file, vec![Algorithm::Md5, Algorithm::Sha256]);
        let value = serde_json::to_value(WorkerCommand::Hash { job, source: None }).unwrap();
        assert_eq!(
            value,
            json!({
                "command": "hash",
                "job": {
                    "id": 9,
                    "file": {"name": "a", "path": "/a", "size": 4, "lastModified": 1000},
                    "status": "pending",
                    "algorithms": ["MD5", "SHA-256"],
                    "processedByteCount": 0,
                    "results": null
                }
            })
        );
    }

    #[test]
    fn events_match_wire_shape() {
        let hashing = WorkerEvent::Hashing { worker_id: 1, job_id: 2, processed_byte_count: 300 };
        assert_eq!(
            serde_json::to_value(&hashing).unwrap(),
            json!({"type": "hashing", "workerId": 1, "jobId": 2, "processedByteCount": 300})
        );

        let hashed = WorkerEvent::Hashed {
            worker_id: 1,
            job_id: 2,
            algorithms: vec![Algorithm::Sha1],
            results: vec!["ff".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&hashed).unwrap(),
            json!({"type": "hashed", "workerId": 1, "jobId": 2, "algorithms": ["SHA-1"], "results": ["ff"]})
        );

        let error: WorkerEvent = serde_json::from_value(
            json!({"type": "error", "workerId": 4, "jobId": 5, "errorMessage": "gone"}),
        )
        .unwrap();
        assert_eq!(
            error,
            WorkerEvent::Error { worker_id: 4, job_id: 5, error_message: "gone".to_string() }
        );
    }
}
