//! Cache lookup in front of the pool and merge-back of computed digests.
//!
//! A record only counts when its size and modification time match the
//! submitted metadata. Writes are serialized so a read-merge-write for one
//! path never interleaves with another.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{Algorithm, FileMeta, FileRecord};
use crate::storage::RecordStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Every requested digest is cached, in request order.
    Hit(Vec<String>),
    /// Some digests are cached; `None` marks the ones to compute.
    Partial(Vec<Option<String>>),
    Miss,
}

impl CacheLookup {
    fn from_slots(slots: Vec<Option<String>>) -> Self {
        if slots.iter().all(Option::is_some) {
            CacheLookup::Hit(slots.into_iter().flatten().collect())
        } else if slots.iter().any(Option::is_some) {
            CacheLookup::Partial(slots)
        } else {
            CacheLookup::Miss
        }
    }

    /// Cached digest per requested algorithm, `None` where it must be computed.
    pub fn into_slots(self, len: usize) -> Vec<Option<String>> {
        match self {
            CacheLookup::Hit(digests) => digests.into_iter().map(Some).collect(),
            CacheLookup::Partial(slots) => slots,
            CacheLookup::Miss => vec![None; len],
        }
    }
}

pub struct DigestCache {
    store: Arc<dyn RecordStore>,
    writes: Mutex<()>,
}

impl DigestCache {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            writes: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Looks up cached digests for `meta`. Store failures count as a miss.
    pub async fn lookup(&self, meta: &FileMeta, algorithms: &[Algorithm]) -> CacheLookup {
        let store = self.store.clone();
        let path = meta.path.clone();
        let record = match task::spawn_blocking(move || store.lookup(&path)).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                warn!(path = %meta.path, error = %e, "cache lookup failed, treating as miss");
                None
            }
            Err(e) => {
                warn!(path = %meta.path, error = %e, "cache lookup task failed, treating as miss");
                None
            }
        };
        let lookup = cached_digests(record.as_ref(), meta, algorithms);
        debug!(path = %meta.path, ?lookup, "cache lookup");
        lookup
    }

    /// Merges computed digests into the record for `meta.path`.
    ///
    /// Digests of other algorithms are kept when the stored record still
    /// matches `meta`; a stale record is replaced wholesale.
    pub async fn merge(
        &self,
        meta: &FileMeta,
        algorithms: &[Algorithm],
        digests: &[String],
    ) -> Result<FileRecord, StoreError> {
        let _guard = self.writes.lock().await;
        let store = self.store.clone();
        let meta = meta.clone();
        let pairs: Vec<(Algorithm, String)> =
            algorithms.iter().copied().zip(digests.iter().cloned()).collect();

        task::spawn_blocking(move || -> Result<FileRecord, StoreError> {
            let mut record = match store.lookup(&meta.path)? {
                Some(existing) if existing.matches(&meta) => existing,
                _ => FileRecord::empty(&meta),
            };
            record.name = meta.name.clone();
            for (algorithm, hex) in pairs {
                record.set_digest(algorithm, hex);
            }
            store.upsert(record.clone())?;
            Ok(record)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Digests from `record` usable for `meta`, aligned with `algorithms`.
pub fn cached_digests(record: Option<&FileRecord>, meta: &FileMeta, algorithms: &[Algorithm]) -> CacheLookup {
    match record {
        Some(record) if record.matches(meta) => CacheLookup::from_slots(
            algorithms
                .iter()
                .map(|a| record.digest(*a).map(str::to_string))
                .collect(),
        ),
        _ => CacheLookup::Miss,
    }
}
