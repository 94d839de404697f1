//! HTTP-facing error taxonomy (§7). Every variant maps to a single
//! `errorTag` and renders the same JSON envelope the handlers return.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rubricforge_core::CoreError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error("quota exceeded")]
    QuotaExceeded { used: u32, limit: i64 },
    #[error("unauthorized")]
    Unauthorized,
    #[error("aggregate content budget exhausted")]
    BudgetExhausted,
    #[error("evaluation deadline exceeded")]
    Timeout,
    #[error("upstream rate limited")]
    RateLimited,
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("grading model returned malformed output: {0}")]
    ParseFailure(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn tag(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "InvalidInput",
            ApiError::NotFound(_) => "NotFound",
            ApiError::QuotaExceeded { .. } => "QuotaExceeded",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::BudgetExhausted => "BudgetExhausted",
            ApiError::Timeout => "Timeout",
            ApiError::RateLimited => "RateLimited",
            ApiError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            ApiError::ParseFailure(_) => "ParseFailure",
            ApiError::Internal(_) => "Internal",
        }
    }

    /// Whether a failure at this tag is attributable to the user's input —
    /// these consume quota on a terminal failure; infrastructure failures
    /// do not (§4.7 step 5).
    pub fn consumes_quota(&self) -> bool {
        matches!(self, ApiError::InvalidInput(_) | ApiError::NotFound(_) | ApiError::ParseFailure(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BudgetExhausted => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::ParseFailure(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::UnknownCourse(_) | CoreError::InvalidPath(_) | CoreError::EmptyCriteria(_) => {
                ApiError::InvalidInput(e.to_string())
            }
            CoreError::InputTooLarge(..) => ApiError::InvalidInput(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            ApiError::QuotaExceeded { used, limit } => {
                json!({ "errorTag": self.tag(), "message": self.to_string(), "used": used, "limit": limit })
            }
            _ => json!({ "errorTag": self.tag(), "message": self.to_string() }),
        };
        (self.status(), Json(body)).into_response()
    }
}
