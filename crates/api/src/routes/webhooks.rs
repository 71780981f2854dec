//! Stripe webhook endpoint
//!
//! The body is taken as raw bytes: the signature covers the exact payload,
//! so it must not pass through a JSON extractor first.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Serialize;
use tradepost_billing::{BillingError, ReconcileOutcome};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub event_id: String,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

/// POST /webhooks/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let billing = state.billing.as_ref().ok_or_else(|| {
        tracing::warn!("Stripe webhook received but billing is not configured");
        ApiError::ServiceUnavailable("Billing is not configured".to_string())
    })?;

    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(payload_len = body.len(), "Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe-Signature header".to_string())
        })?;

    let event = billing.webhooks.verify_event(&body, signature)?;
    let event_id = event.id.clone();
    let event_type = event.event_type.clone();

    let outcome = billing.webhooks.handle_event(event).await.map_err(|e| {
        match &e {
            BillingError::EventInFlight(_) => tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Webhook event already in flight; asking Stripe to retry"
            ),
            _ => tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                retryable = e.is_retryable(),
                error = %e,
                "Stripe webhook processing failed"
            ),
        }
        ApiError::from(e)
    })?;

    Ok(Json(WebhookAck {
        received: true,
        event_id,
        outcome,
    }))
}
