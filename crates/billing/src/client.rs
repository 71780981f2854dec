//! Stripe client configuration

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};

/// Default tolerance between the signature timestamp and local time
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Stripe credentials and webhook settings
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub signature_tolerance_secs: i64,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .field("signature_tolerance_secs", &self.signature_tolerance_secs)
            .finish()
    }
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            signature_tolerance_secs: DEFAULT_SIGNATURE_TOLERANCE_SECS,
        }
    }

    /// Load from STRIPE_SECRET_KEY, STRIPE_WEBHOOK_SECRET and the optional
    /// STRIPE_WEBHOOK_TOLERANCE_SECS
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let signature_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse::<i64>().map_err(|_| {
                BillingError::Config(format!("Invalid STRIPE_WEBHOOK_TOLERANCE_SECS: {}", raw))
            })?,
            Err(_) => DEFAULT_SIGNATURE_TOLERANCE_SECS,
        };

        if webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "STRIPE_WEBHOOK_SECRET is empty".to_string(),
            ));
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            signature_tolerance_secs,
        })
    }

    pub fn with_tolerance(mut self, secs: i64) -> Self {
        self.signature_tolerance_secs = secs;
        self
    }
}

/// Cheaply cloneable handle to the Stripe API
#[derive(Clone)]
pub struct StripeClient {
    inner: Arc<stripe::Client>,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner: Arc::new(inner),
            config: Arc::new(config),
        }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
