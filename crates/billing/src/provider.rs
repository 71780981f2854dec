//! Authoritative subscription lookups
//!
//! Webhook payloads can be partial or stale, so period bounds and status are
//! always re-read from Stripe before they reach the ledger.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stripe::{Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::SubscriptionSnapshot;

#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    async fn fetch_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;
}

/// Stripe-backed provider
pub struct StripeSubscriptionProvider {
    stripe: StripeClient,
}

impl StripeSubscriptionProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

/// Stripe status in its wire form
fn status_str(status: StripeSubStatus) -> &'static str {
    match status {
        StripeSubStatus::Active => "active",
        StripeSubStatus::PastDue => "past_due",
        StripeSubStatus::Canceled => "canceled",
        StripeSubStatus::Unpaid => "unpaid",
        StripeSubStatus::Trialing => "trialing",
        StripeSubStatus::Incomplete => "incomplete",
        StripeSubStatus::IncompleteExpired => "incomplete_expired",
        StripeSubStatus::Paused => "paused",
    }
}

fn timestamp(field: &str, secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| {
        BillingError::UpstreamFetch(format!("Invalid {} timestamp {}: {}", field, secs, e))
    })
}

#[async_trait]
impl SubscriptionProvider for StripeSubscriptionProvider {
    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id = subscription_id.parse::<SubscriptionId>().map_err(|e| {
            BillingError::InvalidInput(format!(
                "Invalid subscription ID {}: {}",
                subscription_id, e
            ))
        })?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to fetch subscription from Stripe"
                );
                BillingError::UpstreamFetch(format!(
                    "Failed to fetch subscription {}: {}",
                    subscription_id, e
                ))
            })?;

        Ok(SubscriptionSnapshot {
            subscription_id: subscription.id.to_string(),
            status: status_str(subscription.status).to_string(),
            current_period_start: timestamp(
                "current_period_start",
                subscription.current_period_start,
            )?,
            current_period_end: timestamp("current_period_end", subscription.current_period_end)?,
            created_at: timestamp("created", subscription.created)?,
        })
    }
}

/// Provider serving snapshots from memory, for tests and local runs
#[derive(Clone, Default)]
pub struct InMemorySubscriptionProvider {
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionSnapshot>>>,
}

impl InMemorySubscriptionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the state reported for a subscription
    pub async fn set(&self, snapshot: SubscriptionSnapshot) {
        self.subscriptions
            .lock()
            .await
            .insert(snapshot.subscription_id.clone(), snapshot);
    }

    pub async fn remove(&self, subscription_id: &str) {
        self.subscriptions.lock().await.remove(subscription_id);
    }
}

#[async_trait]
impl SubscriptionProvider for InMemorySubscriptionProvider {
    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        self.subscriptions
            .lock()
            .await
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::UpstreamFetch(format!("No such subscription: {}", subscription_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_match_stripe_wire_format() {
        assert_eq!(status_str(StripeSubStatus::Active), "active");
        assert_eq!(status_str(StripeSubStatus::PastDue), "past_due");
        assert_eq!(status_str(StripeSubStatus::Canceled), "canceled");
        assert_eq!(
            status_str(StripeSubStatus::IncompleteExpired),
            "incomplete_expired"
        );
    }

    #[test]
    fn test_out_of_range_timestamp_is_upstream_error() {
        let result = timestamp("current_period_end", i64::MAX);
        assert!(matches!(result, Err(BillingError::UpstreamFetch(_))));
    }

    #[tokio::test]
    async fn test_in_memory_provider_reports_unknown_as_upstream_error() {
        let provider = InMemorySubscriptionProvider::new();
        let now = OffsetDateTime::now_utc();
        provider
            .set(SubscriptionSnapshot {
                subscription_id: "sub_1".to_string(),
                status: "active".to_string(),
                current_period_start: now,
                current_period_end: now,
                created_at: now,
            })
            .await;

        assert_eq!(
            provider.fetch_subscription("sub_1").await.unwrap().status,
            "active"
        );
        assert!(matches!(
            provider.fetch_subscription("sub_2").await,
            Err(BillingError::UpstreamFetch(_))
        ));
    }
}
