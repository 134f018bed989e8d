//! API-facing error envelope shared by every HTTP surface.
//!
//! Mirrors the error kinds in `server-common.h` (`error_type`): each variant
//! maps to one HTTP status and one `error.type` string, so every handler can
//! propagate with `?` and let [`ApiError::into_response`] do the framing.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("authentication required")]
    Authentication,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    NotSupported(String),
    #[error("the request exceeds the available context size")]
    ExceedContextSize { n_prompt_tokens: usize, n_ctx: usize },
    #[error("{0}")]
    Server(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Authentication => "authentication",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::NotSupported(_) => "not_supported",
            ApiError::ExceedContextSize { .. } => "exceed_context_size",
            ApiError::Server(_) => "server",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Authentication => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::ExceedContextSize { .. } => StatusCode::BAD_REQUEST,
            ApiError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The JSON body clients see, whether the route is streaming or not.
    pub fn envelope(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": self.status().as_u16(),
            }
        });
        if let ApiError::ExceedContextSize { n_prompt_tokens, n_ctx } = self {
            obj["error"]["n_prompt_tokens"] = (*n_prompt_tokens).into();
            obj["error"]["n_ctx"] = (*n_ctx).into();
        }
        obj
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: serde_json::Value,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(self.envelope());
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
