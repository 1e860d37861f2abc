//! Coordinator Clients
//!
//! `CoordinatorService` is the slice of the coordinator a worker needs. It is
//! implemented over HTTP for real deployments and directly on a `SecuredCoordinator`
//! for single-process setups and tests.
//!
//! The HTTP client retries transport failures with exponential backoff and jitter
//! (150 ms doubling up to 1.2 s). Rejections by the coordinator are never retried.

use crate::codestore::{ArtifactDigest, ArtifactName, WriteOutcome};
use crate::config::WorkerConfig;
use crate::coordinator::protocol::*;
use crate::coordinator::{
    CoordinatorError, JobId, JobStatusReport, JobSubmission, SecuredCoordinator, TaskDescription,
    TaskId, WorkerSpec,
};

use async_trait::async_trait;
use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("coordinator rejected request ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn from_coordinator(e: CoordinatorError) -> Self {
        Self::Remote {
            status: e.status_code().as_u16(),
            message: e.to_string(),
        }
    }

    /// True when the coordinator may simply be unreachable for now.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Remote { status, .. } => matches!(*status, 502..=504),
            Self::Decode(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
    }
}

#[async_trait]
pub trait CoordinatorService: Send + Sync {
    /// `None` when the coordinator has nothing at all to say.
    async fn request_task(&self) -> Result<Option<TaskDescription>, ClientError>;

    async fn submit_task_results(
        &self,
        job_id: JobId,
        task_id: TaskId,
        results: Value,
    ) -> Result<(), ClientError>;

    async fn get_task_worker(&self, job_id: JobId) -> Result<WorkerSpec, ClientError>;

    async fn get_artifact_digest(
        &self,
        name: &ArtifactName,
        job_id: JobId,
    ) -> Result<Option<ArtifactDigest>, ClientError>;

    async fn get_artifact_definition(
        &self,
        name: &ArtifactName,
        job_id: JobId,
    ) -> Result<Vec<u8>, ClientError>;

    /// Liveness check used while reconnecting.
    async fn ping(&self) -> Result<(), ClientError>;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ATTEMPTS: usize = 3;

pub struct HttpCoordinatorClient {
    base_url: String,
    token: Option<String>,
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http_client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.coordinator_url.clone(), config.token.clone())
            .with_retry(config.request_timeout(), config.request_attempts)
    }

    pub fn with_retry(mut self, timeout: Duration, attempts: usize) -> Self {
        self.timeout = timeout;
        self.attempts = attempts.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_with_retry<T: Serialize + Sync>(
        &self,
        url: String,
        payload: &T,
    ) -> Result<reqwest::Response, ClientError> {
        let mut delay_ms = 150u64;
        let mut attempt = 0;

        loop {
            let response = self
                .with_auth(self.http_client.post(url.clone()))
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err(ClientError::Transport(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }
    }

    async fn get_with_retry(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, ClientError> {
        let mut delay_ms = 150u64;
        let mut attempt = 0;

        loop {
            let response = self
                .with_auth(self.http_client.get(url.clone()))
                .query(query)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err(ClientError::Transport(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }
    }

    /// Create a job without attaching logic yet.
    pub async fn create_job(&self, description: &str) -> Result<JobId, ClientError> {
        let request = CreateJobRequest {
            description: description.to_string(),
        };
        let response = self.post_with_retry(self.url(ENDPOINT_JOBS), &request).await?;
        Ok(decode::<JobIdResponse>(response).await?.job_id)
    }

    /// Submit job logic, to `job_id` if given or to a new job otherwise.
    pub async fn submit_job(
        &self,
        submission: JobSubmission,
        job_id: Option<JobId>,
        description: Option<String>,
    ) -> Result<JobId, ClientError> {
        let request = SubmitJobRequest {
            job_id,
            description,
            submission,
        };
        let response = self
            .post_with_retry(self.url(ENDPOINT_SUBMIT_JOB), &request)
            .await?;
        Ok(decode::<JobIdResponse>(response).await?.job_id)
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), ClientError> {
        let response = self
            .post_with_retry(self.url(&job_endpoint(&job_id, "/cancel")), &())
            .await?;
        check(response).await.map(|_| ())
    }

    pub async fn set_job_priority(&self, job_id: JobId, priority: i32) -> Result<(), ClientError> {
        let response = self
            .post_with_retry(
                self.url(&job_endpoint(&job_id, "/priority")),
                &SetPriorityRequest { priority },
            )
            .await?;
        check(response).await.map(|_| ())
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatusReport, ClientError> {
        let response = self
            .get_with_retry(self.url(&job_endpoint(&job_id, "")), &[])
            .await?;
        decode(response).await
    }

    pub async fn set_idle_time(&self, seconds: u64) -> Result<(), ClientError> {
        let response = self
            .post_with_retry(self.url(ENDPOINT_IDLE_TIME), &SetIdleTimeRequest { seconds })
            .await?;
        check(response).await.map(|_| ())
    }

    /// Digest of the current binding of `name`, outside any job.
    pub async fn current_digest(&self, name: &ArtifactName) -> Result<Option<ArtifactDigest>, ClientError> {
        let response = self
            .get_with_retry(
                self.url(ENDPOINT_ARTIFACT_DIGEST),
                &[("name", name.to_string())],
            )
            .await?;
        Ok(decode::<DigestResponse>(response).await?.digest)
    }

    pub async fn set_artifact_definition(
        &self,
        name: &ArtifactName,
        job_id: Option<JobId>,
        bytes: &[u8],
    ) -> Result<WriteOutcome, ClientError> {
        let request = SetDefinitionRequest {
            name: name.to_string(),
            job_id,
            data: STANDARD.encode(bytes),
        };
        let response = self
            .post_with_retry(self.url(ENDPOINT_ARTIFACT_DEFINITION), &request)
            .await?;
        Ok(decode::<SetDefinitionResponse>(response).await?.outcome)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    Err(ClientError::Remote {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    check(response)
        .await?
        .json::<T>()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}

#[async_trait]
impl CoordinatorService for HttpCoordinatorClient {
    async fn request_task(&self) -> Result<Option<TaskDescription>, ClientError> {
        let response = self
            .post_with_retry(self.url(ENDPOINT_TASK_REQUEST), &())
            .await?;
        decode(response).await.map(Some)
    }

    async fn submit_task_results(
        &self,
        job_id: JobId,
        task_id: TaskId,
        results: Value,
    ) -> Result<(), ClientError> {
        let request = SubmitResultsRequest {
            job_id,
            task_id,
            results,
        };
        let response = self
            .post_with_retry(self.url(ENDPOINT_TASK_RESULTS), &request)
            .await?;
        check(response).await.map(|_| ())
    }

    async fn get_task_worker(&self, job_id: JobId) -> Result<WorkerSpec, ClientError> {
        let response = self
            .get_with_retry(self.url(&job_endpoint(&job_id, "/worker")), &[])
            .await?;
        decode(response).await
    }

    async fn get_artifact_digest(
        &self,
        name: &ArtifactName,
        job_id: JobId,
    ) -> Result<Option<ArtifactDigest>, ClientError> {
        let response = self
            .get_with_retry(
                self.url(ENDPOINT_ARTIFACT_DIGEST),
                &[("name", name.to_string()), ("job_id", job_id.to_string())],
            )
            .await?;
        Ok(decode::<DigestResponse>(response).await?.digest)
    }

    async fn get_artifact_definition(
        &self,
        name: &ArtifactName,
        job_id: JobId,
    ) -> Result<Vec<u8>, ClientError> {
        let response = self
            .get_with_retry(
                self.url(ENDPOINT_ARTIFACT_DEFINITION),
                &[("name", name.to_string()), ("job_id", job_id.to_string())],
            )
            .await?;
        let body = decode::<DefinitionResponse>(response).await?;
        STANDARD
            .decode(body.data)
            .map_err(|e| ClientError::Decode(format!("artifact '{}' is not base64: {}", name, e)))
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let response = self.get_with_retry(self.url(ENDPOINT_HEALTH), &[]).await?;
        check(response).await.map(|_| ())
    }
}

/// Talks to a coordinator living in the same process.
pub struct InProcessCoordinator {
    coordinator: Arc<SecuredCoordinator>,
    token: Option<String>,
}

impl InProcessCoordinator {
    pub fn new(coordinator: Arc<SecuredCoordinator>, token: Option<String>) -> Self {
        Self { coordinator, token }
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

#[async_trait]
impl CoordinatorService for InProcessCoordinator {
    async fn request_task(&self) -> Result<Option<TaskDescription>, ClientError> {
        self.coordinator
            .request_task(self.token())
            .map(Some)
            .map_err(ClientError::from_coordinator)
    }

    async fn submit_task_results(
        &self,
        job_id: JobId,
        task_id: TaskId,
        results: Value,
    ) -> Result<(), ClientError> {
        self.coordinator
            .submit_task_results(self.token(), job_id, task_id, results)
            .map_err(ClientError::from_coordinator)
    }

    async fn get_task_worker(&self, job_id: JobId) -> Result<WorkerSpec, ClientError> {
        self.coordinator
            .get_task_worker(self.token(), job_id)
            .map_err(ClientError::from_coordinator)
    }

    async fn get_artifact_digest(
        &self,
        name: &ArtifactName,
        job_id: JobId,
    ) -> Result<Option<ArtifactDigest>, ClientError> {
        self.coordinator
            .get_artifact_digest(self.token(), name.as_str(), Some(job_id))
            .map_err(ClientError::from_coordinator)
    }

    async fn get_artifact_definition(
        &self,
        name: &ArtifactName,
        job_id: JobId,
    ) -> Result<Vec<u8>, ClientError> {
        self.coordinator
            .get_artifact_definition(self.token(), name.as_str(), job_id)
            .map_err(ClientError::from_coordinator)
    }

    async fn ping(&self) -> Result<(), ClientError> {
        Ok(())
    }
}
