use crate::codestore::ArtifactName;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Unique identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// Task number, unique within its job. `0` is reserved for idle instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What `requestTask` hands to a worker.
///
/// A description without a job is an idle instruction: its payload is the number of
/// seconds the worker should wait before asking again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub job_id: Option<JobId>,
    pub task_id: TaskId,
    pub payload: Value,
}

impl TaskDescription {
    pub fn new(job_id: JobId, task_id: TaskId, payload: Value) -> Self {
        Self {
            job_id: Some(job_id),
            task_id,
            payload,
        }
    }

    pub fn idle(seconds: u64) -> Self {
        Self {
            job_id: None,
            task_id: TaskId(0),
            payload: Value::from(seconds),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.job_id.is_none()
    }

    pub fn idle_seconds(&self) -> Option<u64> {
        if self.is_idle() {
            self.payload.as_u64()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, logic not yet attached. Private artifacts may still be staged.
    Created,
    /// Producing tasks.
    Submitted,
    /// The job has stopped producing tasks; waiting for outstanding results.
    Draining,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }

    pub fn is_running(self) -> bool {
        matches!(self, JobState::Submitted | JobState::Draining)
    }
}

/// Tells a worker which artifact implements the job's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub artifact: ArtifactName,
}

/// Job logic to attach on `submitJob`: the artifact holding the job's module definition
/// and the parameters handed to its factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub module: String,
    #[serde(default)]
    pub params: Value,
}

impl JobSubmission {
    pub fn new(module: impl Into<String>, params: Value) -> Self {
        Self {
            module: module.into(),
            params,
        }
    }
}

/// Which job a submission attaches to.
#[derive(Debug, Clone)]
pub enum SubmitTarget {
    /// A job previously allocated with `createJob`.
    Existing(JobId),
    /// Allocate a new job with this description.
    New { description: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub description: String,
    pub state: JobState,
    pub priority: i32,
    pub tasks_issued: u64,
    pub tasks_completed: u64,
    pub result: Option<Value>,
}
