use super::auth::SecuredCoordinator;
use super::error::CoordinatorError;
use super::protocol::*;
use super::types::*;

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;

type Rejection = (StatusCode, Json<ErrorResponse>);
type HandlerResult<T> = Result<(StatusCode, Json<T>), Rejection>;

/// Routes every remote coordinator operation.
pub fn router(coordinator: Arc<SecuredCoordinator>) -> Router {
    Router::new()
        .route(ENDPOINT_JOBS, post(handle_create_job))
        .route(ENDPOINT_SUBMIT_JOB, post(handle_submit_job))
        .route("/jobs/:job_id", get(handle_job_status))
        .route("/jobs/:job_id/cancel", post(handle_cancel_job))
        .route("/jobs/:job_id/priority", post(handle_set_job_priority))
        .route("/jobs/:job_id/worker", get(handle_get_task_worker))
        .route(ENDPOINT_TASK_REQUEST, post(handle_request_task))
        .route(ENDPOINT_TASK_RESULTS, post(handle_submit_task_results))
        .route(ENDPOINT_ARTIFACT_DIGEST, get(handle_get_artifact_digest))
        .route(
            ENDPOINT_ARTIFACT_DEFINITION,
            get(handle_get_artifact_definition).post(handle_set_artifact_definition),
        )
        .route(ENDPOINT_IDLE_TIME, post(handle_set_idle_time))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .layer(Extension(coordinator))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn reject(e: CoordinatorError) -> Rejection {
    let status = e.status_code();
    if status.is_server_error() {
        tracing::error!("Request failed: {}", e);
    } else {
        tracing::debug!("Request rejected ({}): {}", status, e);
    }
    (status, Json(ErrorResponse {
        error: e.to_string(),
    }))
}

pub async fn handle_create_job(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Json(req): Json<CreateJobRequest>,
) -> HandlerResult<JobIdResponse> {
    let job_id = coordinator
        .create_job(bearer_token(&headers), &req.description)
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(JobIdResponse { job_id })))
}

pub async fn handle_submit_job(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Json(req): Json<SubmitJobRequest>,
) -> HandlerResult<JobIdResponse> {
    let target = match (req.job_id, req.description) {
        (Some(job_id), _) => SubmitTarget::Existing(job_id),
        (None, Some(description)) => SubmitTarget::New { description },
        (None, None) => SubmitTarget::New {
            description: req.submission.module.clone(),
        },
    };

    let job_id = coordinator
        .submit_job(bearer_token(&headers), &req.submission, target)
        .map_err(reject)?;
    Ok((StatusCode::OK, Json(JobIdResponse { job_id })))
}

pub async fn handle_job_status(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Path(job_id): Path<JobId>,
) -> HandlerResult<JobStatusReport> {
    let report = coordinator
        .job_status(bearer_token(&headers), job_id)
        .map_err(reject)?;
    Ok((StatusCode::OK, Json(report)))
}

pub async fn handle_cancel_job(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Path(job_id): Path<JobId>,
) -> Result<StatusCode, Rejection> {
    coordinator
        .cancel_job(bearer_token(&headers), job_id)
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_set_job_priority(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Path(job_id): Path<JobId>,
    Json(req): Json<SetPriorityRequest>,
) -> Result<StatusCode, Rejection> {
    coordinator
        .set_job_priority(bearer_token(&headers), job_id, req.priority)
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_get_task_worker(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Path(job_id): Path<JobId>,
) -> HandlerResult<WorkerSpec> {
    let spec = coordinator
        .get_task_worker(bearer_token(&headers), job_id)
        .map_err(reject)?;
    Ok((StatusCode::OK, Json(spec)))
}

pub async fn handle_request_task(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
) -> HandlerResult<TaskDescription> {
    let task = coordinator
        .request_task(bearer_token(&headers))
        .map_err(reject)?;
    Ok((StatusCode::OK, Json(task)))
}

pub async fn handle_submit_task_results(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Json(req): Json<SubmitResultsRequest>,
) -> Result<StatusCode, Rejection> {
    coordinator
        .submit_task_results(bearer_token(&headers), req.job_id, req.task_id, req.results)
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_get_artifact_digest(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Query(query): Query<ArtifactQuery>,
) -> HandlerResult<DigestResponse> {
    let digest = coordinator
        .get_artifact_digest(bearer_token(&headers), &query.name, query.job_id)
        .map_err(reject)?;
    Ok((StatusCode::OK, Json(DigestResponse { digest })))
}

pub async fn handle_get_artifact_definition(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Query(query): Query<ArtifactQuery>,
) -> HandlerResult<DefinitionResponse> {
    let job_id = query.job_id.ok_or_else(|| {
        reject(CoordinatorError::InvalidArgument(
            "job_id is required".to_string(),
        ))
    })?;

    let bytes = coordinator
        .get_artifact_definition(bearer_token(&headers), &query.name, job_id)
        .map_err(reject)?;

    Ok((
        StatusCode::OK,
        Json(DefinitionResponse {
            name: query.name,
            data: STANDARD.encode(bytes),
        }),
    ))
}

pub async fn handle_set_artifact_definition(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Json(req): Json<SetDefinitionRequest>,
) -> HandlerResult<SetDefinitionResponse> {
    let bytes = STANDARD.decode(&req.data).map_err(|e| {
        reject(CoordinatorError::InvalidArgument(format!(
            "artifact data is not base64: {}",
            e
        )))
    })?;

    let outcome = coordinator
        .set_artifact_definition(bearer_token(&headers), &req.name, req.job_id, &bytes)
        .map_err(reject)?;
    Ok((StatusCode::OK, Json(SetDefinitionResponse { outcome })))
}

pub async fn handle_set_idle_time(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
    headers: HeaderMap,
    Json(req): Json<SetIdleTimeRequest>,
) -> Result<StatusCode, Rejection> {
    coordinator
        .set_idle_time(bearer_token(&headers), req.seconds)
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_health(
    Extension(coordinator): Extension<Arc<SecuredCoordinator>>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            active_jobs: coordinator.coordinator().active_jobs().len(),
        }),
    )
}
