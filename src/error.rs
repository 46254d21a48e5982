use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use utoipa::ToSchema;

use crate::repo::RepoError;
use crate::retry::TransientError;
use crate::service::ServiceError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found")] NotFound,
    #[error("conflict: {0}")] Conflict(String),
    #[error("{0}")] BadRequest(String),
    #[error("payload too large")] PayloadTooLarge,
    #[error("backend unavailable, try again")] Unavailable,
    #[error("internal error")] Internal,
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Conflict => ApiError::Conflict("already exists".into()),
            e if e.is_retryable() => ApiError::Unavailable,
            e => {
                tracing::error!(error = %e, "backend call failed");
                ApiError::Internal
            }
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Invalid(msg) => ApiError::BadRequest(msg),
            ServiceError::TooLarge(_) => ApiError::PayloadTooLarge,
            ServiceError::Rejected(err) => match err.code.as_deref() {
                Some("P0002") => ApiError::NotFound,
                Some("P0001") => ApiError::Conflict(err.message),
                _ => ApiError::BadRequest(err.message),
            },
            ServiceError::Repo(e) => e.into(),
            ServiceError::Storage(e) if e.is_retryable() => ApiError::Unavailable,
            ServiceError::Storage(e) => {
                tracing::error!(error = %e, "evidence storage failed");
                ApiError::Internal
            }
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        HttpResponse::build(status).json(ApiErrorBody { error: self.to_string() })
    }
}
