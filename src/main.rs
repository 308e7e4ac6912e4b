use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, warn};

use digestpool::file_ops::{self, LocalFile};
use digestpool::{Algorithm, DigestCache, HashPool, JobId, JobStatus, JsonRecordStore, PoolConfig, PoolEvent};

#[derive(Parser)]
#[command(name = "digestpool")]
#[command(about = "Compute MD5, SHA-1 and SHA-256 digests of large files in parallel")]
struct Cli {
    /// Files to hash
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Algorithms to compute (MD5, SHA-1, SHA-256); defaults to all three
    #[arg(short, long = "algorithm")]
    algorithms: Vec<Algorithm>,

    /// Number of workers (defaults to available parallelism)
    #[arg(short, long)]
    workers: Option<usize>,

    /// JSON pool configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Digest cache file
    #[arg(long, default_value = "digests.json")]
    db: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    digestpool::logging::init(cli.verbose);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    }
}

/// Returns whether every file hashed successfully.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = match &cli.config {
        Some(path) => PoolConfig::load(path)?,
        None => PoolConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }
    let algorithms = if cli.algorithms.is_empty() {
        Algorithm::all()
    } else {
        cli.algorithms.clone()
    };

    let store = JsonRecordStore::open(&cli.db)
        .with_context(|| format!("failed to open digest cache {}", cli.db.display()))?;
    let cache = Arc::new(DigestCache::new(Arc::new(store)));
    let (pool, mut events) = HashPool::start(config, cache)?;

    let mut names: HashMap<JobId, String> = HashMap::new();
    let mut sizes: HashMap<JobId, u64> = HashMap::new();
    let mut ok = true;
    for path in &cli.files {
        let meta = match file_ops::file_meta(path) {
            Ok(meta) => meta,
            Err(e) => {
                eprintln!("{}: {:#}", path.display(), e);
                ok = false;
                continue;
            }
        };
        let name = meta.path.clone();
        let size = meta.size;
        let id = pool.submit(meta, LocalFile::new(path), &algorithms).await?;
        names.insert(id, name);
        sizes.insert(id, size);
    }

    let mut outstanding = names.len();
    while outstanding > 0 {
        let Some(event) = events.recv().await else {
            break;
        };
        match event {
            PoolEvent::Progress { job_id, processed_byte_count } => {
                let total = sizes.get(&job_id).copied().unwrap_or(0).max(1);
                eprintln!(
                    "{}: {:.1}%",
                    names.get(&job_id).map(String::as_str).unwrap_or("?"),
                    processed_byte_count as f64 * 100.0 / total as f64
                );
            }
            PoolEvent::Succeeded { job_id, algorithms, results, .. } => {
                outstanding -= 1;
                let name = names.get(&job_id).map(String::as_str).unwrap_or("?");
                for (algorithm, digest) in algorithms.iter().zip(&results) {
                    println!("{algorithm:<8} {digest}  {name}");
                }
            }
            PoolEvent::Failed { job_id, error_message } => {
                outstanding -= 1;
                ok = false;
                let name = names.get(&job_id).map(String::as_str).unwrap_or("?");
                eprintln!("{name}: {error_message}");
            }
            PoolEvent::CacheWriteFailed { path, error_message, .. } => {
                warn!(%path, "digest not cached: {}", error_message);
            }
            _ => {}
        }
    }

    // Shutdown waits for the remaining cache writes.
    let jobs = pool.shutdown().await?;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::CacheWriteFailed { path, error_message, .. } = event {
            warn!(%path, "digest not cached: {}", error_message);
        }
    }
    ok &= jobs.iter().all(|j| j.job.status == JobStatus::Succeeded);
    Ok(ok)
}
