//! Worker Runtime
//!
//! A fixed pool of execution slots pulling tasks from the coordinator. Idle slot ids
//! sit on a channel; the dispatch loop takes one, runs it on its own tokio task and
//! the slot puts itself back when done, so at most `concurrency` tasks ever run at
//! once.
//!
//! ## Per-slot execution
//! 1. Ask for a task. Nothing, or an idle instruction, means sleeping.
//! 2. Resolve the job's worker code through the worker and artifact caches.
//! 3. Run the task and submit the results.
//!
//! A failing task never takes the slot down. Losing the coordinator drops the task,
//! waits until it answers again and returns the slot to the pool.

use super::cache::{ArtifactCache, CacheStats, WorkerCache};
use super::client::{ClientError, CoordinatorService};
use super::registry::{TaskWorkerHandle, TaskWorkerRegistry};
use crate::config::WorkerConfig;
use crate::coordinator::{JobId, TaskDescription};
use crate::module::ModuleDefinition;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How a single slot execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotOutcome {
    /// No work; the slot slept.
    Idle,
    Completed,
    /// The task or its results were rejected. Not retried.
    Failed,
    /// The coordinator became unreachable mid-task.
    Dropped,
}

#[derive(Debug, Default)]
struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    idle: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub idle: u64,
}

impl WorkerStats {
    fn record(&self, outcome: SlotOutcome) {
        let counter = match outcome {
            SlotOutcome::Idle => &self.idle,
            SlotOutcome::Completed => &self.completed,
            SlotOutcome::Failed => &self.failed,
            SlotOutcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerRuntime {
    service: Arc<dyn CoordinatorService>,
    /// Task functions by module kind.
    registry: Arc<TaskWorkerRegistry>,
    /// Artifact bytes by digest, shared by every job.
    artifacts: ArtifactCache,
    /// Resolved task worker per job.
    workers: WorkerCache,
    config: WorkerConfig,
    stats: WorkerStats,
    shutdown: CancellationToken,
}

impl WorkerRuntime {
    /// Creates an idle runtime. Nothing is contacted until `run` or `run_once`.
    ///
    /// # Arguments
    /// * `service` - The coordinator, over HTTP or in process.
    /// * `registry` - Task functions the fetched worker modules may name.
    /// * `config` - Slot count, cache sizes and reconnect backoff.
    ///
    /// # Returns
    /// A shared handle; `run` takes a clone of it.
    pub fn new(
        service: Arc<dyn CoordinatorService>,
        registry: Arc<TaskWorkerRegistry>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            registry,
            artifacts: ArtifactCache::new(config.artifact_cache_capacity),
            workers: WorkerCache::new(config.worker_cache_capacity),
            config,
            stats: WorkerStats::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the dispatch loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn artifact_stats(&self) -> CacheStats {
        self.artifacts.stats()
    }

    pub fn pool_size(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Runs the slot pool until the shutdown token is cancelled, then waits for the
    /// slots that are still busy.
    pub async fn run(self: Arc<Self>) {
        let pool_size = self.pool_size();
        tracing::info!("Starting worker runtime with {} slots", pool_size);

        let (idle_tx, mut idle_rx) = mpsc::channel::<usize>(pool_size);
        for slot in 0..pool_size {
            // Capacity equals the pool size, so this never waits.
            let _ = idle_tx.send(slot).await;
        }

        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(slot) = idle_rx.recv() => {
                    let runtime = self.clone();
                    let idle_tx = idle_tx.clone();
                    running.spawn(async move {
                        let outcome = runtime.run_slot(slot).await;
                        runtime.stats.record(outcome);
                        let _ = idle_tx.send(slot).await;
                    });
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Worker slot aborted: {}", e);
                    }
                }
            }
        }

        tracing::info!(
            "Worker runtime stopping, waiting for {} busy slots",
            running.len()
        );
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker slot aborted: {}", e);
            }
        }

        let stats = self.stats();
        tracing::info!(
            "Worker runtime stopped: {} completed, {} failed, {} dropped",
            stats.completed,
            stats.failed,
            stats.dropped
        );
    }

    /// One slot execution outside the pool, recorded in the stats like any other.
    pub async fn run_once(&self) -> SlotOutcome {
        let outcome = self.run_slot(0).await;
        self.stats.record(outcome);
        outcome
    }

    async fn run_slot(&self, slot: usize) -> SlotOutcome {
        let task = match self.service.request_task().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.idle(self.config.idle_seconds).await;
                return SlotOutcome::Idle;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("Slot {} could not reach the coordinator: {}", slot, e);
                self.reconnect().await;
                return SlotOutcome::Dropped;
            }
            Err(e) => {
                tracing::warn!("Slot {} was refused a task: {}", slot, e);
                self.idle(self.config.idle_seconds).await;
                return SlotOutcome::Failed;
            }
        };

        let Some(job_id) = task.job_id else {
            let seconds = task.idle_seconds().unwrap_or(self.config.idle_seconds);
            tracing::trace!("Slot {} told to idle for {}s", slot, seconds);
            self.idle(seconds).await;
            return SlotOutcome::Idle;
        };

        let results = match self.execute(job_id, &task).await {
            Ok(results) => results,
            Err(e) => {
                let transient = e
                    .downcast_ref::<ClientError>()
                    .is_some_and(ClientError::is_transient);
                if transient {
                    tracing::warn!(
                        "Slot {} lost the coordinator during task {} of job {}: {:#}",
                        slot,
                        task.task_id,
                        job_id,
                        e
                    );
                    self.reconnect().await;
                    return SlotOutcome::Dropped;
                }
                tracing::warn!("Task {} of job {} failed: {:#}", task.task_id, job_id, e);
                return SlotOutcome::Failed;
            }
        };

        match self
            .service
            .submit_task_results(job_id, task.task_id, results)
            .await
        {
            Ok(()) => {
                tracing::debug!("Slot {} completed task {} of job {}", slot, task.task_id, job_id);
                SlotOutcome::Completed
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    "Slot {} could not deliver results of task {}: {}",
                    slot,
                    task.task_id,
                    e
                );
                self.reconnect().await;
                SlotOutcome::Dropped
            }
            Err(e) => {
                tracing::warn!(
                    "Results of task {} of job {} were rejected: {}",
                    task.task_id,
                    job_id,
                    e
                );
                SlotOutcome::Failed
            }
        }
    }

    async fn execute(&self, job_id: JobId, task: &TaskDescription) -> Result<Value> {
        let handle = self
            .workers
            .get_or_resolve(job_id, || self.resolve_worker(job_id))
            .await?;
        handle
            .perform(job_id, task.task_id, task.payload.clone())
            .await
    }

    async fn resolve_worker(&self, job_id: JobId) -> Result<TaskWorkerHandle> {
        let spec = self.service.get_task_worker(job_id).await?;
        let (digest, bytes) = self
            .artifacts
            .fetch(self.service.as_ref(), &spec.artifact, job_id)
            .await?;
        let module = ModuleDefinition::from_bytes(&bytes)
            .with_context(|| format!("artifact '{}' is not a module definition", spec.artifact))?;
        let handle = self.registry.resolve(module, digest)?;

        tracing::info!(
            "Resolved worker {} ({}) for job {}",
            spec.artifact,
            handle.kind,
            job_id
        );
        Ok(handle)
    }

    async fn idle(&self, seconds: u64) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Pings the coordinator with backoff until it answers or the runtime stops.
    async fn reconnect(&self) {
        let mut delay_ms = self.config.reconnect_initial_ms.max(1);

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            match self.service.ping().await {
                Ok(()) => {
                    tracing::info!("Coordinator reachable again");
                    return;
                }
                Err(e) => tracing::debug!("Coordinator still unreachable: {}", e),
            }

            let jitter = rand::random::<u64>() % 50;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms.saturating_add(jitter))) => {}
                _ = self.shutdown.cancelled() => return,
            }
            delay_ms = next_backoff(delay_ms, self.config.reconnect_max_ms);
        }
    }
}

/// Doubles `delay_ms`, capped at `max_ms` (at least 1ms).
pub(crate) fn next_backoff(delay_ms: u64, max_ms: u64) -> u64 {
    delay_ms.saturating_mul(2).min(max_ms.max(1))
}
