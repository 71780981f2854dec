//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Signature header missing, malformed, stale, or not matching the body
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Body authenticated but is not a usable event envelope
    #[error("Malformed webhook event: {0}")]
    MalformedEvent(String),

    /// Ledger entry written but its business account could not be resolved or updated
    #[error("Projection failed: {0}")]
    Projection(String),

    /// Authoritative subscription lookup against Stripe failed
    #[error("Upstream fetch failed: {0}")]
    UpstreamFetch(String),

    /// Another worker holds a fresh claim on this event
    #[error("Webhook event {0} is currently being processed")]
    EventInFlight(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether Stripe should be encouraged to redeliver the event.
    ///
    /// Authentication and payload failures will never succeed on retry;
    /// everything transient or integrity-related should.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Projection(_)
                | BillingError::UpstreamFetch(_)
                | BillingError::EventInFlight(_)
                | BillingError::Database(_)
                | BillingError::Internal(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BillingError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        BillingError::Database(format!("migration failed: {}", e))
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::UpstreamFetch(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_failure_is_not_retryable() {
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::MalformedEvent("bad json".into()).is_retryable());
    }

    #[test]
    fn test_processing_failures_are_retryable() {
        assert!(BillingError::Projection("missing account".into()).is_retryable());
        assert!(BillingError::UpstreamFetch("timeout".into()).is_retryable());
        assert!(BillingError::Database("connection reset".into()).is_retryable());
    }
}
