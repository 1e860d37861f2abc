//! Worker-Side Caches
//!
//! - `ArtifactCache`: artifact bytes keyed by `(name, digest)`. The coordinator is
//!   always asked for the digest first, so bytes are only transferred when the worker
//!   has never seen that exact version.
//! - `WorkerCache`: resolved, ready-to-run task workers per job. Concurrent slots
//!   asking for the same job wait on a single resolution.

use super::client::CoordinatorService;
use super::registry::TaskWorkerHandle;
use crate::codestore::{ArtifactDigest, ArtifactName};
use crate::coordinator::JobId;

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OnceCell;

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bytes_fetched: u64,
    pub entries: usize,
}

pub struct ArtifactCache {
    entries: Mutex<LruCache<(ArtifactName, ArtifactDigest), Arc<Vec<u8>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_fetched: AtomicU64,
}

impl ArtifactCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity(max_entries))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
        }
    }

    /// Bytes of `name` as the job sees it, fetched only if this digest is not cached.
    ///
    /// Fetched bytes must hash to the advertised digest, otherwise nothing is cached
    /// and an error is returned.
    pub async fn fetch(
        &self,
        service: &dyn CoordinatorService,
        name: &ArtifactName,
        job_id: JobId,
    ) -> Result<(ArtifactDigest, Arc<Vec<u8>>)> {
        let digest = service
            .get_artifact_digest(name, job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("artifact '{}' not found for job {}", name, job_id))?;
        let key = (name.clone(), digest.clone());

        let cached = self.entries.lock().get(&key).cloned();
        if let Some(bytes) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Artifact cache hit for {} ({})", name, digest);
            return Ok((digest, bytes));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let bytes = service.get_artifact_definition(name, job_id).await?;
        self.bytes_fetched
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let received = ArtifactDigest::compute(&bytes);
        if received != digest {
            anyhow::bail!(
                "artifact '{}' digest mismatch: advertised {}, received {}",
                name,
                digest,
                received
            );
        }

        tracing::debug!("Fetched artifact {} ({}, {} bytes)", name, digest, bytes.len());
        let bytes = Arc::new(bytes);
        self.entries.lock().put(key, bytes.clone());
        Ok((digest, bytes))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

type WorkerSlot = Arc<OnceCell<Arc<TaskWorkerHandle>>>;

pub struct WorkerCache {
    entries: Mutex<LruCache<JobId, WorkerSlot>>,
}

impl WorkerCache {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity(max_jobs))),
        }
    }

    /// Returns the cached worker of `job_id`, running `resolve` if there is none.
    ///
    /// Callers racing on the same job share one resolution. A failed resolution
    /// leaves no entry behind, so the next caller tries again.
    pub async fn get_or_resolve<F, Fut>(&self, job_id: JobId, resolve: F) -> Result<Arc<TaskWorkerHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TaskWorkerHandle>>,
    {
        let slot = {
            let mut entries = self.entries.lock();
            match entries.get(&job_id) {
                Some(slot) => slot.clone(),
                None => {
                    let slot = WorkerSlot::default();
                    entries.put(job_id, slot.clone());
                    slot
                }
            }
        };

        let resolved = slot
            .get_or_try_init(|| async { resolve().await.map(Arc::new) })
            .await;

        match resolved {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                let mut entries = self.entries.lock();
                if entries
                    .peek(&job_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    entries.pop(&job_id);
                }
                Err(e)
            }
        }
    }

    /// True if a resolved worker for the job is cached.
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.entries
            .lock()
            .peek(job_id)
            .is_some_and(|slot| slot.initialized())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
