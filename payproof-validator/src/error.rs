//! Error types for the validation HTTP surface

use crate::pipeline::PipelineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Proof image could not be read (503, retryable)
    #[error("Storage fetch failed: {0}")]
    StorageFetch(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// payproof-common error
    #[error("Common error: {0}")]
    Common(#[from] payproof_common::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::StorageFetch(msg) => ApiError::StorageFetch(msg),
            PipelineError::Database(e) => ApiError::Common(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message, retryable) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, false),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, false),
            ApiError::StorageFetch(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_FETCH_FAILED",
                msg,
                true,
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg,
                false,
            ),
            ApiError::Common(payproof_common::Error::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg, false)
            }
            ApiError::Common(payproof_common::Error::InvalidInput(msg)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, false)
            }
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
                false,
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "retryable": retryable,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_storage_failure_is_retryable_503() {
        let response = ApiError::from(PipelineError::StorageFetch("storage returned 404".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "STORAGE_FETCH_FAILED");
        assert_eq!(body["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn test_common_not_found_maps_to_404() {
        let response =
            ApiError::Common(payproof_common::Error::NotFound("verdict".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["retryable"], false);
    }
}
