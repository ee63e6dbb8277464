//! HTTP error mapping
//!
//! Every error body is `{"message": ...}`. Internal details are logged, never
//! returned.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hotspot_billing::BillingError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Callback payload missing `reference` or `status`, or not JSON at all
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A central or tenant store is unreachable; the gateway should retry
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("unauthorized")]
    Unauthorized,

    /// Also returned for admin routes when no admin token is configured
    #[error("not found")]
    NotFound,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayload(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            ApiError::InvalidPayload(_) => "Invalid Payload".to_string(),
            ApiError::StoreUnavailable(_) => "Store Unavailable".to_string(),
            ApiError::Unauthorized => "Unauthorized".to_string(),
            ApiError::NotFound => "Not Found".to_string(),
            ApiError::Validation(msg) => msg.clone(),
            ApiError::Internal(_) => "Internal Error".to_string(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => ApiError::InvalidPayload(msg),
            e @ BillingError::StoreUnavailable { .. } => ApiError::StoreUnavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }
        (status, Json(json!({ "message": self.public_message() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
