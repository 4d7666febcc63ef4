use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::mask::mask_secrets;

/// Webhook-side error taxonomy. The coordinator never constructs these;
/// it maps failures onto its default action instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid payload: {0}")]
    BadRequest(String),

    #[error("authentication failed")]
    Unauthorized,

    #[error("machine identity rejected")]
    IdentityRejected,

    #[error("approval request not found")]
    NotFound,

    #[error("approval request expired")]
    Expired,

    #[error("request resolved concurrently")]
    RaceLost,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("webhook secret not configured: {0}")]
    MissingSecret(&'static str),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::BadRequest(detail) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": mask_secrets(detail) })),
                )
                    .into_response();
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            AppError::IdentityRejected => (StatusCode::FORBIDDEN, "invalid signature"),
            AppError::NotFound => (StatusCode::NOT_FOUND, "approval request not found"),
            AppError::Expired => (StatusCode::GONE, "approval request expired"),
            AppError::RaceLost => (StatusCode::CONFLICT, "request was resolved concurrently"),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"),
            AppError::MissingSecret(name) => {
                tracing::error!(secret = %name, "required webhook secret is not configured");
                (StatusCode::INTERNAL_SERVER_ERROR, "server misconfigured")
            }
            AppError::Store(e) => {
                tracing::error!("store error: {}", mask_secrets(e));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {}", mask_secrets(&e.to_string()));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        };

        (status, Json(json!({ "error": msg }))).into_response()
    }
}
