//! Task Worker Registry
//!
//! Maps module kinds (e.g. `range_sum.worker`) to executable Rust closures. A worker
//! resolves the module definition it fetched for a job into a `TaskWorkerHandle`
//! through this registry, so the runtime stays generic over what tasks compute.

use crate::codestore::ArtifactDigest;
use crate::coordinator::{JobId, TaskId};
use crate::module::ModuleDefinition;

use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Everything a task function gets to see.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub job_id: JobId,
    pub task_id: TaskId,
    /// `params` of the worker's module definition.
    pub params: Value,
    pub payload: Value,
}

/// Type alias for a thread-safe, asynchronous task function.
/// It takes a `TaskInput` and resolves to the task's results.
pub type TaskWorkerFn =
    Arc<dyn Fn(TaskInput) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A job's worker code, resolved and ready to run.
#[derive(Clone)]
pub struct TaskWorkerHandle {
    pub kind: String,
    pub digest: ArtifactDigest,
    pub params: Value,
    func: TaskWorkerFn,
}

impl TaskWorkerHandle {
    /// Runs one task on its own tokio task, so a panicking task function surfaces as an
    /// error instead of taking the slot down.
    pub async fn perform(&self, job_id: JobId, task_id: TaskId, payload: Value) -> Result<Value> {
        let input = TaskInput {
            job_id,
            task_id,
            params: self.params.clone(),
            payload,
        };

        match tokio::spawn((self.func)(input)).await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!(
                "task worker '{}' aborted on task {}: {}",
                self.kind,
                task_id,
                e
            )),
        }
    }
}

impl std::fmt::Debug for TaskWorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorkerHandle")
            .field("kind", &self.kind)
            .field("digest", &self.digest)
            .finish()
    }
}

pub struct TaskWorkerRegistry {
    workers: DashMap<String, TaskWorkerFn>,
}

impl TaskWorkerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a task function under a module kind.
    pub fn register<F, Fut>(&self, kind: &str, worker: F)
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        // Type-erase the future so different async functions share one map.
        let worker_fn: TaskWorkerFn = Arc::new(move |input: TaskInput| {
            Box::pin(worker(input)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        });

        self.workers.insert(kind.to_string(), worker_fn);

        tracing::info!("Registered task worker: {}", kind);
    }

    /// Binds a fetched module definition to the registered function for its kind.
    pub fn resolve(&self, module: ModuleDefinition, digest: ArtifactDigest) -> Result<TaskWorkerHandle> {
        let func = self
            .workers
            .get(&module.kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown task worker kind: {}", module.kind))?;

        Ok(TaskWorkerHandle {
            kind: module.kind,
            digest,
            params: module.params,
            func,
        })
    }

    pub fn list_kinds(&self) -> Vec<String> {
        self.workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn has_worker(&self, kind: &str) -> bool {
        self.workers.contains_key(kind)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for TaskWorkerRegistry {
    fn default() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }
}
