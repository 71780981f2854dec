//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tradepost_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Server-side details stay in the logs
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::MalformedEvent(msg) => ApiError::BadRequest(msg),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::EventInFlight(id) => {
                ApiError::Conflict(format!("Webhook event {} is being processed", id))
            }
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Projection(_)
            | BillingError::UpstreamFetch(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(e: BillingError) -> StatusCode {
        ApiError::from(e).into_response().status()
    }

    #[test]
    fn test_billing_error_status_codes() {
        assert_eq!(status(BillingError::WebhookSignatureInvalid), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(BillingError::MalformedEvent("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(BillingError::EventInFlight("evt_1".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(BillingError::Projection("orphan".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(BillingError::UpstreamFetch("timeout".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(BillingError::NotFound("evt_1".into())),
            StatusCode::NOT_FOUND
        );
    }
}
