//! Job Logic
//!
//! A `ParallelizableJob` splits a computation into task payloads and folds the
//! results back together. Implementations are statically linked and looked up by the
//! `kind` of the module definition a submission names, through a `JobFactoryRegistry`.

use crate::codestore::ArtifactName;
use crate::module::ModuleDefinition;

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error("malformed results: {0}")]
    MalformedResults(String),

    #[error("{0}")]
    Failed(String),
}

/// Decomposition and aggregation logic of one job.
pub trait ParallelizableJob: Send {
    /// Artifact whose module definition the workers execute.
    fn worker_artifact(&self) -> ArtifactName;

    /// Next task payload, or `None` when the job has nothing more to hand out right now.
    fn next_task(&mut self) -> Result<Option<Value>, JobExecutionError>;

    /// Folds the results of one task back into the job.
    fn submit_task_results(&mut self, task: Value, results: Value) -> Result<(), JobExecutionError>;

    fn is_complete(&self) -> bool;

    /// Called once after `is_complete` turns true. The returned value is kept as the
    /// job's result.
    fn finish(&mut self) -> Result<Value, JobExecutionError>;
}

/// Builds a job from its module definition and the submission parameters.
pub type JobFactoryFn = Arc<
    dyn Fn(&ModuleDefinition, &Value) -> Result<Box<dyn ParallelizableJob>, JobExecutionError>
        + Send
        + Sync,
>;

/// Registry of job factories keyed by module kind.
pub struct JobFactoryRegistry {
    factories: DashMap<String, JobFactoryFn>,
}

impl JobFactoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&ModuleDefinition, &Value) -> Result<Box<dyn ParallelizableJob>, JobExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        tracing::info!("Registered job factory: {}", kind);
    }

    /// Instantiates the job for `module`. `None` if no factory handles its kind.
    pub fn create(
        &self,
        module: &ModuleDefinition,
        params: &Value,
    ) -> Option<Result<Box<dyn ParallelizableJob>, JobExecutionError>> {
        // Clone out of the map so the factory never runs under a shard lock.
        let factory = self.factories.get(&module.kind).map(|f| f.value().clone())?;
        Some(factory(module, params))
    }

    pub fn has_factory(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }
}

impl Default for JobFactoryRegistry {
    fn default() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }
}
