//! Hash worker: one digest engine behind a command/event channel pair.
//!
//! A worker runs as its own tokio task and moves each hashing pass onto the
//! blocking pool. It shares nothing with the dispatcher except messages.

use std::any::Any;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{self, JoinError, JoinHandle};
use tracing::{debug, error, warn};

use crate::error::{HashError, PoolError};
use crate::file_ops::FileHandle;
use crate::hashers::{DigestEngine, DigestOutput};
use crate::models::{Algorithm, HashJob, JobId, WorkerId};
use crate::protocol::{Diagnostic, WorkerCommand, WorkerEvent};

pub const DIAGNOSTICS_TARGET: &str = "digestpool::diagnostics";

pub struct HashWorker {
    id: Option<WorkerId>,
    engine: DigestEngine,
    events: UnboundedSender<WorkerEvent>,
    diagnostics: UnboundedSender<Diagnostic>,
}

impl HashWorker {
    pub fn new(
        engine: DigestEngine,
        events: UnboundedSender<WorkerEvent>,
        diagnostics: UnboundedSender<Diagnostic>,
    ) -> Self {
        Self {
            id: None,
            engine,
            events,
            diagnostics,
        }
    }

    /// Processes commands until `terminate` arrives or the command channel closes.
    pub async fn run(mut self, mut commands: UnboundedReceiver<WorkerCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::Init { id } => self.init(id),
                WorkerCommand::Hash { job, source } => {
                    let Some(worker_id) = self.id else {
                        self.report_defect(0, Some(job.id), "hash command received before init".to_string());
                        continue;
                    };
                    let Some(source) = source else {
                        self.send(WorkerEvent::Error {
                            worker_id,
                            job_id: job.id,
                            error_message: format!("no file handle supplied for {}", job.file.name),
                        });
                        continue;
                    };
                    if self.hash(worker_id, job, source, &mut commands).await.is_break() {
                        break;
                    }
                }
                WorkerCommand::Terminate => break,
            }
        }
        debug!(worker = ?self.id, "worker terminated");
    }

    fn init(&mut self, id: WorkerId) {
        match self.id {
            Some(current) => warn!(worker = current, requested = id, "ignoring repeated init"),
            None => {
                self.id = Some(id);
                debug!(worker = id, "worker initialised");
            }
        }
    }

    /// Runs one job. Breaks when the worker was terminated mid-pass.
    async fn hash(
        &self,
        worker_id: WorkerId,
        job: HashJob,
        source: FileHandle,
        commands: &mut UnboundedReceiver<WorkerCommand>,
    ) -> ControlFlow<()> {
        let job_id = job.id;
        let algorithms = job.algorithms.clone();
        let abort = Arc::new(AtomicBool::new(false));
        debug!(worker = worker_id, job = job_id, file = %job.file.path, "hashing");

        let mut pass = {
            let engine = self.engine;
            let events = self.events.clone();
            let abort = abort.clone();
            let algorithms = algorithms.clone();
            let name = job.file.name.clone();
            task::spawn_blocking(move || -> Result<DigestOutput, HashError> {
                let reader = source.open().map_err(|source| HashError::Open {
                    name: name.clone(),
                    source,
                })?;
                let mut last_sent = 0;
                let out = engine.compute(&name, reader, &algorithms, &abort, |processed_byte_count| {
                    last_sent = processed_byte_count;
                    let _ = events.send(WorkerEvent::Hashing {
                        worker_id,
                        job_id,
                        processed_byte_count,
                    });
                })?;
                // Trailing update so the last observed count is the full length.
                if out.byte_count > last_sent {
                    let _ = events.send(WorkerEvent::Hashing {
                        worker_id,
                        job_id,
                        processed_byte_count: out.byte_count,
                    });
                }
                Ok(out)
            })
        };

        loop {
            tokio::select! {
                joined = &mut pass => {
                    self.finish(worker_id, job_id, algorithms, joined);
                    return ControlFlow::Continue(());
                }
                command = commands.recv() => match command {
                    Some(WorkerCommand::Terminate) | None => {
                        abort.store(true, Ordering::Relaxed);
                        debug!(worker = worker_id, job = job_id, "terminated while hashing");
                        return ControlFlow::Break(());
                    }
                    Some(WorkerCommand::Hash { job: other, .. }) => {
                        self.send(WorkerEvent::Error {
                            worker_id,
                            job_id: other.id,
                            error_message: format!("worker {worker_id} is busy with job {job_id}"),
                        });
                    }
                    Some(WorkerCommand::Init { id }) => {
                        warn!(worker = worker_id, requested = id, "ignoring repeated init");
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        worker_id: WorkerId,
        job_id: JobId,
        algorithms: Vec<Algorithm>,
        joined: Result<Result<DigestOutput, HashError>, JoinError>,
    ) {
        match joined {
            Ok(Ok(out)) => self.send(WorkerEvent::Hashed {
                worker_id,
                job_id,
                algorithms,
                results: out.digests,
            }),
            Ok(Err(e)) => self.send(WorkerEvent::Error {
                worker_id,
                job_id,
                error_message: e.to_string(),
            }),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                self.report_defect(worker_id, Some(job_id), format!("hashing pass panicked: {message}"));
            }
            Err(e) => self.report_defect(worker_id, Some(job_id), format!("hashing pass cancelled: {e}")),
        }
    }

    fn report_defect(&self, worker_id: WorkerId, job_id: Option<JobId>, message: String) {
        error!(target: DIAGNOSTICS_TARGET, worker = worker_id, job = ?job_id, "{}", message);
        let _ = self.diagnostics.send(Diagnostic {
            worker_id,
            job_id,
            message,
        });
    }

    fn send(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!(worker = ?self.id, "event receiver dropped");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Dispatcher-side handle to a spawned worker.
pub struct WorkerHandle {
    id: WorkerId,
    commands: UnboundedSender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawns a worker task and performs the `init` handshake.
    pub fn spawn(
        id: WorkerId,
        engine: DigestEngine,
        events: UnboundedSender<WorkerEvent>,
        diagnostics: UnboundedSender<Diagnostic>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(HashWorker::new(engine, events, diagnostics).run(rx));
        let _ = commands.send(WorkerCommand::Init { id });
        Self { id, commands, task }
    }

    /// Hands a job and its content handle to the worker.
    pub fn hash(&self, job: HashJob, source: FileHandle) -> Result<(), PoolError> {
        self.commands
            .send(WorkerCommand::Hash {
                job,
                source: Some(source),
            })
            .map_err(|_| PoolError::WorkerGone(self.id))
    }

    pub fn terminate(self) -> JoinHandle<()> {
        let _ = self.commands.send(WorkerCommand::Terminate);
        self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileMeta;
    use chrono::Utc;
    use std::io::{self, Cursor, Read};
    use std::time::Duration;

    fn job(id: u64, size: u64) -> HashJob {
        let file = FileMeta {
            name: format!("file-{id}"),
            path: format!("/tmp/file-{id}"),
            size,
            last_modified: Utc::now(),
        };
        HashJob::new(id, file, vec![Algorithm::Md5, Algorithm::Sha1])
    }

    fn bytes(data: Vec<u8>) -> FileHandle {
        FileHandle::new(move || -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(Cursor::new(data.clone())))
        })
    }

    fn spawn(
        engine: DigestEngine,
    ) -> (WorkerHandle, UnboundedReceiver<WorkerEvent>, UnboundedReceiver<Diagnostic>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (diag_tx, diag_rx) = mpsc::unbounded_channel();
        (WorkerHandle::spawn(7, engine, events_tx, diag_tx), events_rx, diag_rx)
    }

    async fn terminal(events: &mut UnboundedReceiver<WorkerEvent>) -> (Vec<u64>, WorkerEvent) {
        let mut progress = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for worker")
                .expect("worker event channel closed");
            match event {
                WorkerEvent::Hashing { processed_byte_count, .. } => progress.push(processed_byte_count),
                other => return (progress, other),
            }
        }
    }

    #[tokio::test]
    async fn hashes_job_and_reports_full_progress() {
        let (worker, mut events, _diag) = spawn(DigestEngine::new(16, 40));
        worker.hash(job(1, 100), bytes(vec![5u8; 100])).unwrap();

        let (progress, event) = terminal(&mut events).await;
        assert_eq!(progress, vec![48, 96, 100]);
        match event {
            WorkerEvent::Hashed { worker_id, job_id, algorithms, results } => {
                assert_eq!(worker_id, 7);
                assert_eq!(job_id, 1);
                assert_eq!(algorithms, vec![Algorithm::Md5, Algorithm::Sha1]);
                assert_eq!(results.len(), 2);
                assert_eq!(results[0], format!("{:x}", md5::compute([5u8; 100])));
            }
            other => panic!("unexpected event {other:?}"),
        }
        worker.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn read_failure_becomes_error_event_and_worker_stays_usable() {
        let (worker, mut events, _diag) = spawn(DigestEngine::default());
        let broken = FileHandle::new(|| -> io::Result<Box<dyn Read + Send>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "file removed"))
        });
        worker.hash(job(1, 10), broken).unwrap();
        match terminal(&mut events).await.1 {
            WorkerEvent::Error { job_id, error_message, .. } => {
                assert_eq!(job_id, 1);
                assert!(error_message.contains("file removed"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        worker.hash(job(2, 3), bytes(b"abc".to_vec())).unwrap();
        assert!(matches!(terminal(&mut events).await.1, WorkerEvent::Hashed { job_id: 2, .. }));
        worker.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn panics_go_to_diagnostics_not_the_protocol() {
        let (worker, mut events, mut diag) = spawn(DigestEngine::default());
        let panicking = FileHandle::new(|| -> io::Result<Box<dyn Read + Send>> {
            panic!("reader exploded")
        });
        worker.hash(job(3, 1), panicking).unwrap();

        let diagnostic = tokio::time::timeout(Duration::from_secs(10), diag.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diagnostic.worker_id, 7);
        assert_eq!(diagnostic.job_id, Some(3));
        assert!(diagnostic.message.contains("reader exploded"));
        assert!(events.try_recv().is_err());
        worker.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn terminating_an_idle_worker_ends_its_task() {
        let (worker, mut events, _diag) = spawn(DigestEngine::default());
        worker.terminate().await.unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn hash_on_a_stopped_worker_reports_it_gone() {
        let (commands, rx) = mpsc::unbounded_channel();
        drop(rx);
        let worker = WorkerHandle {
            id: 9,
            commands,
            task: tokio::spawn(async {}),
        };
        assert_eq!(worker.hash(job(1, 0), bytes(Vec::new())), Err(PoolError::WorkerGone(9)));
    }

    #[tokio::test]
    async fn hash_before_init_is_a_defect() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (diag_tx, mut diag) = mpsc::unbounded_channel();
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(HashWorker::new(DigestEngine::default(), events_tx, diag_tx).run(rx));

        commands
            .send(WorkerCommand::Hash { job: job(4, 0), source: Some(bytes(Vec::new())) })
            .unwrap();
        commands.send(WorkerCommand::Terminate).unwrap();
        task.await.unwrap();

        assert_eq!(diag.recv().await.unwrap().job_id, Some(4));
        assert!(events.recv().await.is_none());
    }
}
