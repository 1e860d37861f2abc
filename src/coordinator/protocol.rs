//! Network Protocol Definitions
//!
//! DTOs exchanged between the coordinator and its clients (workers, job submitters,
//! the synchronisation tool). Artifact bytes travel base64-encoded.

use super::types::*;
use crate::codestore::{ArtifactDigest, WriteOutcome};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ENDPOINT_JOBS: &str = "/jobs";
pub const ENDPOINT_SUBMIT_JOB: &str = "/jobs/submit";
pub const ENDPOINT_TASK_REQUEST: &str = "/tasks/request";
pub const ENDPOINT_TASK_RESULTS: &str = "/tasks/results";
pub const ENDPOINT_ARTIFACT_DIGEST: &str = "/artifacts/digest";
pub const ENDPOINT_ARTIFACT_DEFINITION: &str = "/artifacts/definition";
pub const ENDPOINT_IDLE_TIME: &str = "/admin/idle";
pub const ENDPOINT_HEALTH: &str = "/health";

/// `/jobs/<id>` followed by `suffix` (`""`, `"/cancel"`, `"/priority"`, `"/worker"`).
pub fn job_endpoint(job_id: &JobId, suffix: &str) -> String {
    format!("{}/{}{}", ENDPOINT_JOBS, job_id, suffix)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobIdResponse {
    pub job_id: JobId,
}

/// Attaches logic to `job_id`, or to a new job described by `description`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub description: Option<String>,
    pub submission: JobSubmission,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetPriorityRequest {
    pub priority: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResultsRequest {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub results: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArtifactQuery {
    pub name: String,
    pub job_id: Option<JobId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DigestResponse {
    pub digest: Option<ArtifactDigest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DefinitionResponse {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetDefinitionRequest {
    pub name: String,
    pub job_id: Option<JobId>,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetDefinitionResponse {
    #[serde(flatten)]
    pub outcome: WriteOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetIdleTimeRequest {
    pub seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_jobs: usize,
}
