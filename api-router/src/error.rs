use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize, Clone)]
pub enum ApiError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid resource options found: {0:?}")]
    InvalidOptions(Vec<String>),

    /// The resource refused to launch the job; the text comes from the backend.
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// Anything that goes wrong while proxying to a job. Never carries detail.
    #[error("Upstream failure")]
    UpstreamFailure,
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::Validation(msg) => Self::ValidationError(msg),
            AppError::Auth(msg) => Self::Unauthorized(msg),
            AppError::InvalidOptions(errors) => Self::InvalidOptions(errors),
            AppError::Launch(msg) => Self::LaunchFailed(msg),
            _ => {
                tracing::error!("Internal error: {:?}", err);
                Self::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InternalError(message) | Self::LaunchFailed(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            Self::ValidationError(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            Self::InvalidOptions(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Invalid resource options found: {errors:?}"),
            ),
            Self::UpstreamFailure => (
                StatusCode::BAD_GATEWAY,
                "Upstream failure".to_string(),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                status: "error".to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    status: String,
}
