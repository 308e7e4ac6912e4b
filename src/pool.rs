//! Job queue and pool dispatcher.
//!
//! `HashPool` is the caller-facing handle. All job state lives in a single
//! dispatcher task which owns a fixed set of workers, a FIFO queue of
//! pending jobs and the job table. Callers, workers and the dispatcher only
//! talk through channels.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cache::DigestCache;
use crate::config::{default_workers, PoolConfig};
use crate::error::{ConfigError, PoolError};
use crate::file_ops::{FileHandle, FileSource};
use crate::hashers::DigestEngine;
use crate::models::{Algorithm, FileMeta, HashJob, JobId, JobStatus, WorkerId};
use crate::protocol::{Diagnostic, WorkerEvent};
use crate::worker::WorkerHandle;

/// Notifications for the pool's observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PoolEvent {
    Queued {
        job_id: JobId,
    },
    Started {
        job_id: JobId,
        worker_id: WorkerId,
    },
    Progress {
        job_id: JobId,
        processed_byte_count: u64,
    },
    Succeeded {
        job_id: JobId,
        algorithms: Vec<Algorithm>,
        results: Vec<String>,
        from_cache: bool,
    },
    Failed {
        job_id: JobId,
        error_message: String,
    },
    /// Computed digests were written to the record store.
    Persisted {
        job_id: JobId,
        path: String,
    },
    /// The job still succeeded; only the cache write failed.
    CacheWriteFailed {
        job_id: JobId,
        path: String,
        error_message: String,
    },
    Diagnostic(Diagnostic),
}

impl PoolEvent {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            PoolEvent::Queued { job_id }
            | PoolEvent::Started { job_id, .. }
            | PoolEvent::Progress { job_id, .. }
            | PoolEvent::Succeeded { job_id, .. }
            | PoolEvent::Failed { job_id, .. }
            | PoolEvent::Persisted { job_id, .. }
            | PoolEvent::CacheWriteFailed { job_id, .. } => Some(*job_id),
            PoolEvent::Diagnostic(d) => d.job_id,
        }
    }
}

/// Point-in-time copy of a job as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: HashJob,
    pub error_message: Option<String>,
}

enum PoolCommand {
    Submit {
        job: HashJob,
        source: FileHandle,
        cached: Vec<Option<String>>,
    },
    Job {
        id: JobId,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
}

pub struct HashPool {
    commands: UnboundedSender<PoolCommand>,
    cache: Arc<DigestCache>,
    next_id: AtomicU64,
    size: usize,
    task: JoinHandle<()>,
}

impl HashPool {
    /// Spawns the dispatcher and its workers. Must be called inside a tokio runtime.
    pub fn start(
        config: PoolConfig,
        cache: Arc<DigestCache>,
    ) -> Result<(Self, UnboundedReceiver<PoolEvent>), ConfigError> {
        config.validate()?;
        if config.workers > default_workers() {
            warn!(
                workers = config.workers,
                parallelism = default_workers(),
                "more workers than available parallelism"
            );
        }
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (observer, observer_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(&config, cache.clone(), observer);
        let size = dispatcher.workers.len();
        let task = tokio::spawn(dispatcher.run(commands_rx));
        info!(workers = size, "hash pool started");

        Ok((
            Self {
                commands,
                cache,
                next_id: AtomicU64::new(1),
                size,
                task,
            },
            observer_rx,
        ))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues a job and returns its id without waiting for hashing.
    ///
    /// Digests already cached for an unchanged file are reused; when all of
    /// them are cached the job succeeds without touching a worker.
    pub async fn submit(
        &self,
        file: FileMeta,
        source: impl FileSource,
        algorithms: &[Algorithm],
    ) -> Result<JobId, PoolError> {
        let algorithms = Algorithm::dedup(algorithms);
        if algorithms.is_empty() {
            return Err(PoolError::NoAlgorithms);
        }
        if self.commands.is_closed() {
            return Err(PoolError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cached = self
            .cache
            .lookup(&file, &algorithms)
            .await
            .into_slots(algorithms.len());
        let job = HashJob::new(id, file, algorithms);
        self.commands
            .send(PoolCommand::Submit {
                job,
                source: FileHandle::new(source),
                cached,
            })
            .map_err(|_| PoolError::Closed)?;
        Ok(id)
    }

    /// Finished jobs stay in the table until the pool shuts down.
    pub async fn job(&self, id: JobId) -> Result<Option<JobSnapshot>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Job { id, reply })
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    pub async fn jobs(&self) -> Result<Vec<JobSnapshot>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Jobs { reply })
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Terminates every worker and waits for pending cache writes.
    ///
    /// Unfinished jobs are returned in whatever state they were in.
    pub async fn shutdown(self) -> Result<Vec<JobSnapshot>, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Shutdown { reply })
            .map_err(|_| PoolError::Closed)?;
        let jobs = rx.await.map_err(|_| PoolError::Closed)?;
        if let Err(e) = self.task.await {
            error!(error = %e, "dispatcher task failed");
        }
        Ok(jobs)
    }
}

struct WorkerSlot {
    handle: WorkerHandle,
    current: Option<JobId>,
}

struct JobEntry {
    job: HashJob,
    source: Option<FileHandle>,
    /// Cached digest per requested algorithm; `None` slots are computed.
    cached: Vec<Option<String>>,
    error_message: Option<String>,
}

impl JobEntry {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job: self.job.clone(),
            error_message: self.error_message.clone(),
        }
    }

    fn missing(&self) -> Vec<Algorithm> {
        self.job
            .algorithms
            .iter()
            .zip(&self.cached)
            .filter(|(_, slot)| slot.is_none())
            .map(|(a, _)| *a)
            .collect()
    }

    /// Fills the missing slots, in order, with freshly computed digests.
    fn assemble(&self, computed: Vec<String>) -> Option<Vec<String>> {
        let mut computed = computed.into_iter();
        let results: Option<Vec<String>> = self
            .cached
            .iter()
            .map(|slot| slot.clone().or_else(|| computed.next()))
            .collect();
        if computed.next().is_some() {
            return None;
        }
        results
    }
}

struct Dispatcher {
    workers: BTreeMap<WorkerId, WorkerSlot>,
    idle: VecDeque<WorkerId>,
    queue: VecDeque<JobId>,
    /// Every job submitted since start. Nothing is evicted before shutdown.
    jobs: HashMap<JobId, JobEntry>,
    cache: Arc<DigestCache>,
    /// In-flight cache writes.
    writes: JoinSet<()>,
    observer: UnboundedSender<PoolEvent>,
    events: UnboundedReceiver<WorkerEvent>,
    diagnostics: UnboundedReceiver<Diagnostic>,
}

impl Dispatcher {
    fn new(config: &PoolConfig, cache: Arc<DigestCache>, observer: UnboundedSender<PoolEvent>) -> Self {
        let engine = DigestEngine::new(config.chunk_size, config.progress_interval);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (diagnostics_tx, diagnostics) = mpsc::unbounded_channel();

        let mut workers = BTreeMap::new();
        let mut idle = VecDeque::new();
        for id in 1..=config.workers as WorkerId {
            let handle = WorkerHandle::spawn(id, engine, events_tx.clone(), diagnostics_tx.clone());
            workers.insert(id, WorkerSlot { handle, current: None });
            idle.push_back(id);
        }

        Self {
            workers,
            idle,
            queue: VecDeque::new(),
            jobs: HashMap::new(),
            cache,
            writes: JoinSet::new(),
            observer,
            events,
            diagnostics,
        }
    }

    async fn run(mut self, mut commands: UnboundedReceiver<PoolCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PoolCommand::Shutdown { reply }) => {
                        let jobs = self.shutdown().await;
                        let _ = reply.send(jobs);
                        return;
                    }
                    Some(PoolCommand::Submit { job, source, cached }) => self.admit(job, source, cached),
                    Some(PoolCommand::Job { id, reply }) => {
                        let _ = reply.send(self.jobs.get(&id).map(JobEntry::snapshot));
                    }
                    Some(PoolCommand::Jobs { reply }) => {
                        let _ = reply.send(self.snapshots());
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(diagnostic) = self.diagnostics.recv() => self.handle_diagnostic(diagnostic),
                Some(written) = self.writes.join_next(), if !self.writes.is_empty() => {
                    if let Err(e) = written {
                        error!(error = %e, "cache write task failed");
                    }
                }
            }
        }
    }

    fn snapshots(&self) -> Vec<JobSnapshot> {
        let mut all: Vec<JobSnapshot> = self.jobs.values().map(JobEntry::snapshot).collect();
        all.sort_by_key(|s| s.job.id);
        all
    }

    fn admit(&mut self, mut job: HashJob, source: FileHandle, cached: Vec<Option<String>>) {
        let id = job.id;
        if cached.iter().all(Option::is_some) {
            let results: Vec<String> = cached.into_iter().flatten().collect();
            job.status = JobStatus::Succeeded;
            job.results = Some(results.clone());
            debug!(job = id, path = %job.file.path, "served from cache");
            self.notify(PoolEvent::Succeeded {
                job_id: id,
                algorithms: job.algorithms.clone(),
                results,
                from_cache: true,
            });
            self.jobs.insert(
                id,
                JobEntry {
                    job,
                    source: None,
                    cached: Vec::new(),
                    error_message: None,
                },
            );
            return;
        }

        self.jobs.insert(
            id,
            JobEntry {
                job,
                source: Some(source),
                cached,
                error_message: None,
            },
        );
        self.queue.push_back(id);
        self.notify(PoolEvent::Queued { job_id: id });
        self.dispatch();
    }

    /// Pairs idle workers with queued jobs, oldest job first.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker_id) = self.idle.pop_front() else {
                return;
            };
            let Some(job_id) = self.queue.pop_front() else {
                self.idle.push_front(worker_id);
                return;
            };
            let Some(entry) = self.jobs.get_mut(&job_id) else {
                self.idle.push_front(worker_id);
                continue;
            };
            let Some(source) = entry.source.take() else {
                self.idle.push_front(worker_id);
                self.fail(job_id, "file handle already consumed".to_string());
                continue;
            };

            entry.job.status = JobStatus::Processing;
            let mut assignment = entry.job.clone();
            assignment.algorithms = entry.missing();

            let Some(slot) = self.workers.get_mut(&worker_id) else {
                self.fail(job_id, format!("worker {worker_id} is not part of the pool"));
                continue;
            };
            match slot.handle.hash(assignment, source) {
                Ok(()) => {
                    slot.current = Some(job_id);
                    debug!(job = job_id, worker = worker_id, "dispatched");
                    self.notify(PoolEvent::Started { job_id, worker_id });
                }
                Err(e) => {
                    warn!(worker = worker_id, "worker is gone, removing from pool");
                    self.workers.remove(&worker_id);
                    self.fail(job_id, e.to_string());
                }
            }
        }
    }

    /// The job currently assigned to `worker_id`, if it is `job_id`.
    fn assigned(&mut self, worker_id: WorkerId, job_id: JobId) -> Option<&mut JobEntry> {
        let current = self.workers.get(&worker_id)?.current;
        if current != Some(job_id) {
            return None;
        }
        self.jobs
            .get_mut(&job_id)
            .filter(|e| e.job.status == JobStatus::Processing)
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        let (worker_id, job_id) = (event.worker_id(), event.job_id());
        let Some(entry) = self.assigned(worker_id, job_id) else {
            warn!(worker = worker_id, job = job_id, "event for a job the worker does not hold");
            return;
        };

        match event {
            WorkerEvent::Hashing { processed_byte_count, .. } => {
                let count = entry.job.processed_byte_count.max(processed_byte_count);
                entry.job.processed_byte_count = count;
                self.notify(PoolEvent::Progress {
                    job_id,
                    processed_byte_count: count,
                });
            }
            WorkerEvent::Hashed { algorithms, results, .. } => {
                if algorithms != entry.missing() || results.len() != algorithms.len() {
                    self.defect(worker_id, job_id, "result does not match the assigned algorithms");
                    return;
                }
                let Some(all) = entry.assemble(results.clone()) else {
                    self.defect(worker_id, job_id, "result does not match the assigned algorithms");
                    return;
                };
                entry.job.status = JobStatus::Succeeded;
                entry.job.results = Some(all.clone());
                let requested = entry.job.algorithms.clone();
                let meta = entry.job.file.clone();
                info!(job = job_id, path = %meta.path, "hashed");

                self.notify(PoolEvent::Succeeded {
                    job_id,
                    algorithms: requested,
                    results: all,
                    from_cache: false,
                });
                self.persist(job_id, meta, algorithms, results);
                self.release(worker_id);
            }
            WorkerEvent::Error { error_message, .. } => {
                self.fail(job_id, error_message);
                self.release(worker_id);
            }
        }
    }

    fn handle_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.notify(PoolEvent::Diagnostic(diagnostic.clone()));
        if let Some(job_id) = diagnostic.job_id {
            if self.assigned(diagnostic.worker_id, job_id).is_some() {
                self.fail(job_id, format!("internal worker failure: {}", diagnostic.message));
                self.release(diagnostic.worker_id);
            }
        }
    }

    /// A worker broke the protocol for its current job.
    fn defect(&mut self, worker_id: WorkerId, job_id: JobId, message: &str) {
        error!(target: crate::worker::DIAGNOSTICS_TARGET, worker = worker_id, job = job_id, "{}", message);
        self.handle_diagnostic(Diagnostic {
            worker_id,
            job_id: Some(job_id),
            message: message.to_string(),
        });
    }

    fn fail(&mut self, job_id: JobId, error_message: String) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if !entry.job.status.can_become(JobStatus::Failed) {
            return;
        }
        warn!(job = job_id, path = %entry.job.file.path, error = %error_message, "job failed");
        entry.job.status = JobStatus::Failed;
        entry.job.results = None;
        entry.error_message = Some(error_message.clone());
        entry.source = None;
        self.notify(PoolEvent::Failed { job_id, error_message });
    }

    /// Marks a worker idle and hands it the next queued job.
    fn release(&mut self, worker_id: WorkerId) {
        if let Some(slot) = self.workers.get_mut(&worker_id) {
            slot.current = None;
            self.idle.push_back(worker_id);
        }
        self.dispatch();
    }

    /// Writes computed digests back to the cache without holding up the dispatcher.
    fn persist(&mut self, job_id: JobId, meta: FileMeta, algorithms: Vec<Algorithm>, digests: Vec<String>) {
        let cache = self.cache.clone();
        let observer = self.observer.clone();
        self.writes.spawn(async move {
            let event = match cache.merge(&meta, &algorithms, &digests).await {
                Ok(_) => PoolEvent::Persisted {
                    job_id,
                    path: meta.path,
                },
                Err(e) => {
                    warn!(job = job_id, path = %meta.path, error = %e, "failed to cache digests");
                    PoolEvent::CacheWriteFailed {
                        job_id,
                        path: meta.path,
                        error_message: e.to_string(),
                    }
                }
            };
            let _ = observer.send(event);
        });
    }

    fn notify(&self, event: PoolEvent) {
        let _ = self.observer.send(event);
    }

    async fn shutdown(&mut self) -> Vec<JobSnapshot> {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut self.workers)
            .into_values()
            .map(|slot| slot.handle.terminate())
            .collect();
        self.idle.clear();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "worker task failed");
            }
        }
        while let Some(written) = self.writes.join_next().await {
            if let Err(e) = written {
                error!(error = %e, "cache write task failed");
            }
        }
        info!(jobs = self.jobs.len(), "hash pool shut down");
        self.snapshots()
    }
}
