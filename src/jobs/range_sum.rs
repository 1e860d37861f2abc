//! Range Sum
//!
//! Sums `i^power` over `[start, end)`, one task per chunk of the range.

use crate::codestore::ArtifactName;
use crate::coordinator::{JobExecutionError, ParallelizableJob};
use crate::module::ModuleDefinition;
use crate::worker::registry::TaskInput;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const JOB_ARTIFACT: &str = "demo.range_sum.job";
pub const WORKER_ARTIFACT: &str = "demo.range_sum.worker";
pub const JOB_KIND: &str = "range_sum.job";
pub const WORKER_KIND: &str = "range_sum.worker";

const DEFAULT_CHUNK: u64 = 1000;

fn default_chunk() -> u64 {
    DEFAULT_CHUNK
}

fn default_power() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeSumParams {
    pub start: u64,
    pub end: u64,
    #[serde(default = "default_chunk")]
    pub chunk: u64,
    #[serde(default = "default_power")]
    pub power: u32,
}

/// Payload of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeChunk {
    pub from: u64,
    pub to: u64,
    pub power: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSum {
    pub sum: u64,
}

#[derive(Debug, Deserialize)]
struct JobModuleParams {
    #[serde(default)]
    worker: Option<String>,
}

pub fn job_module() -> ModuleDefinition {
    ModuleDefinition::new(JOB_KIND, json!({ "worker": WORKER_ARTIFACT }))
}

pub fn worker_module() -> ModuleDefinition {
    ModuleDefinition::new(WORKER_KIND, json!({}))
}

pub struct RangeSumJob {
    worker: ArtifactName,
    next: u64,
    end: u64,
    chunk: u64,
    power: u32,
    chunks_issued: u64,
    chunks_received: u64,
    total: u64,
}

impl RangeSumJob {
    pub fn new(worker: ArtifactName, params: RangeSumParams) -> Result<Self, JobExecutionError> {
        if params.chunk == 0 {
            return Err(JobExecutionError::InvalidParameters(
                "chunk must be positive".to_string(),
            ));
        }
        if params.start > params.end {
            return Err(JobExecutionError::InvalidParameters(format!(
                "start {} is past end {}",
                params.start, params.end
            )));
        }

        Ok(Self {
            worker,
            next: params.start,
            end: params.end,
            chunk: params.chunk,
            power: params.power,
            chunks_issued: 0,
            chunks_received: 0,
            total: 0,
        })
    }

    /// Factory registered for `JOB_KIND`.
    pub fn from_module(
        module: &ModuleDefinition,
        params: &Value,
    ) -> Result<Box<dyn ParallelizableJob>, JobExecutionError> {
        let module_params: JobModuleParams = serde_json::from_value(module.params.clone())
            .map_err(|e| JobExecutionError::InvalidParameters(e.to_string()))?;
        let worker = module_params.worker.as_deref().unwrap_or(WORKER_ARTIFACT);
        let worker = ArtifactName::parse(worker)
            .map_err(|e| JobExecutionError::InvalidParameters(e.to_string()))?;

        let params: RangeSumParams = serde_json::from_value(params.clone())
            .map_err(|e| JobExecutionError::InvalidParameters(e.to_string()))?;

        Ok(Box::new(Self::new(worker, params)?))
    }
}

impl ParallelizableJob for RangeSumJob {
    fn worker_artifact(&self) -> ArtifactName {
        self.worker.clone()
    }

    fn next_task(&mut self) -> Result<Option<Value>, JobExecutionError> {
        if self.next >= self.end {
            return Ok(None);
        }

        let to = self.next.saturating_add(self.chunk).min(self.end);
        let chunk = RangeChunk {
            from: self.next,
            to,
            power: self.power,
        };
        self.next = to;
        self.chunks_issued += 1;

        serde_json::to_value(chunk)
            .map(Some)
            .map_err(|e| JobExecutionError::Failed(e.to_string()))
    }

    fn submit_task_results(&mut self, _task: Value, results: Value) -> Result<(), JobExecutionError> {
        let ChunkSum { sum } = serde_json::from_value(results)
            .map_err(|e| JobExecutionError::MalformedResults(e.to_string()))?;

        self.total = self
            .total
            .checked_add(sum)
            .ok_or_else(|| JobExecutionError::Failed("range sum overflowed u64".to_string()))?;
        self.chunks_received += 1;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.next >= self.end && self.chunks_received == self.chunks_issued
    }

    fn finish(&mut self) -> Result<Value, JobExecutionError> {
        Ok(json!({ "sum": self.total, "chunks": self.chunks_received }))
    }
}

/// Task function registered for `WORKER_KIND`.
pub async fn sum_chunk(input: TaskInput) -> Result<Value> {
    let chunk: RangeChunk = serde_json::from_value(input.payload)?;

    let mut sum = 0u64;
    for i in chunk.from..chunk.to {
        let term = i
            .checked_pow(chunk.power)
            .ok_or_else(|| anyhow::anyhow!("{}^{} overflows u64", i, chunk.power))?;
        sum = sum
            .checked_add(term)
            .ok_or_else(|| anyhow::anyhow!("chunk sum overflows u64"))?;
    }

    Ok(serde_json::to_value(ChunkSum { sum })?)
}
