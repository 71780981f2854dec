//! Stripe webhook signature verification
//!
//! Verification runs over the exact bytes received. The body is only parsed
//! once the signature has been accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::event::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

/// Parsed `Stripe-Signature` header: `t=<unix>,v1=<hex>[,v1=<hex>][,v0=<hex>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Every v1 signature present; Stripe sends several while secrets roll
    pub v1_signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Option<Self> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "t" => timestamp = value.trim().parse().ok(),
                "v1" => {
                    if let Ok(bytes) = hex::decode(value.trim()) {
                        v1_signatures.push(bytes);
                    }
                }
                // v0 and unknown schemes are ignored
                _ => {}
            }
        }

        let timestamp = timestamp?;
        if v1_signatures.is_empty() {
            return None;
        }

        Some(Self {
            timestamp,
            v1_signatures,
        })
    }
}

/// Authenticates inbound webhook deliveries against the endpoint secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify and parse a webhook delivery
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.verify_event_at(payload, signature, now)
    }

    /// Same as [`verify_event`](Self::verify_event) with an explicit clock
    pub fn verify_event_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        self.verify_signature(payload, signature, now)?;

        serde_json::from_slice::<WebhookEvent>(payload).map_err(|e| {
            tracing::warn!(
                payload_len = payload.len(),
                parse_error = %e,
                "Authenticated webhook body is not a valid event"
            );
            BillingError::MalformedEvent(e.to_string())
        })
    }

    fn verify_signature(&self, payload: &[u8], signature: &str, now: i64) -> BillingResult<()> {
        let header = SignatureHeader::parse(signature).ok_or_else(|| {
            tracing::warn!(
                signature_len = signature.len(),
                "Webhook signature header missing timestamp or v1 signature"
            );
            BillingError::WebhookSignatureInvalid
        })?;

        let drift = (now - header.timestamp).abs();
        if drift > self.tolerance_secs {
            tracing::warn!(
                drift_secs = drift,
                tolerance_secs = self.tolerance_secs,
                "Webhook signature timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = self.compute(header.timestamp, payload)?;
        let matched = header
            .v1_signatures
            .iter()
            .any(|candidate| bool::from(candidate.as_slice().ct_eq(expected.as_slice())));

        if !matched {
            tracing::warn!(
                payload_len = payload.len(),
                candidates = header.v1_signatures.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    fn compute(&self, timestamp: i64, payload: &[u8]) -> BillingResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Produce a header value for `payload`, in the format Stripe sends
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let signature = self.compute(timestamp, payload)?;
        Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
    }
}
