use super::job::JobExecutionError;
use crate::codestore::StoreError;

use axum::http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Job code named by a submission could not be resolved.
    #[error("resolution failed: {0}")]
    Resolution(String),

    #[error("permission '{permission}' denied")]
    Unauthorized { permission: String },

    #[error("job failed: {0}")]
    Job(#[from] JobExecutionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordinatorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Resolution(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized { .. } => StatusCode::FORBIDDEN,
            Self::Job(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(StoreError::InvalidName { .. }) => StatusCode::BAD_REQUEST,
            Self::Store(e) if e.is_invalid_state() => StatusCode::CONFLICT,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
