//! Stripe webhook handling
//!
//! Reconciles subscription lifecycle events into the ledger and the owning
//! business account. Every accepted event is recorded in the receipt log so
//! redeliveries are acknowledged without reprocessing and failures can be
//! replayed by an operator.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::event::{classify, Classification, SkipReason, Transition, WebhookEvent};
use crate::ledger::{
    is_terminal_status, plan_upsert, SubscriptionSnapshot, UnchangedReason, UpsertPlan,
};
use crate::projector::{plan_projection, ProjectionPlan, ProjectionSignal, SubscriptionStatus};
use crate::provider::{StripeSubscriptionProvider, SubscriptionProvider};
use crate::signature::WebhookVerifier;
use crate::store::{
    ClaimOutcome, EventLog, PgBillingStore, ProcessingResult, ReconciliationStore,
    WebhookEventRecord,
};

/// Claims older than this are considered abandoned and may be reclaimed
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Default cap for bulk replays
pub const DEFAULT_REPLAY_LIMIT: i64 = 100;

/// What happened to the ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "change", content = "reason", rename_all = "snake_case")]
pub enum LedgerChange {
    Created,
    Updated,
    Unchanged(UnchangedReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedTransition {
    pub transition: &'static str,
    pub subscription_id: String,
    pub business_account_id: Uuid,
    pub ledger: LedgerChange,
    pub account_status: SubscriptionStatus,
    pub account_changed: bool,
}

/// Result of handling one authenticated event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied(AppliedTransition),
    /// Event id was already processed to completion
    Duplicate { previous_result: ProcessingResult },
    Ignored(SkipReason),
}

impl ReconcileOutcome {
    fn processing_result(&self) -> ProcessingResult {
        match self {
            ReconcileOutcome::Applied(_) => ProcessingResult::Success,
            ReconcileOutcome::Duplicate { previous_result } => *previous_result,
            ReconcileOutcome::Ignored(_) => ProcessingResult::Ignored,
        }
    }
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    verifier: WebhookVerifier,
    provider: Arc<dyn SubscriptionProvider>,
    store: Arc<dyn ReconciliationStore>,
    events: Arc<dyn EventLog>,
}

impl WebhookHandler {
    pub fn new(
        verifier: WebhookVerifier,
        provider: Arc<dyn SubscriptionProvider>,
        store: Arc<dyn ReconciliationStore>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            verifier,
            provider,
            store,
            events,
        }
    }

    /// Production wiring: Stripe for lookups, Postgres for state and receipts
    pub fn from_stripe(stripe: StripeClient, store: PgBillingStore) -> Self {
        let verifier = WebhookVerifier::new(
            stripe.config().webhook_secret.clone(),
            stripe.config().signature_tolerance_secs,
        );
        let store = Arc::new(store);
        Self::new(
            verifier,
            Arc::new(StripeSubscriptionProvider::new(stripe)),
            store.clone(),
            store,
        )
    }

    /// Verify and parse a Stripe webhook delivery
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        self.verifier.verify_event(payload, signature)
    }

    /// Handle an authenticated event exactly once.
    ///
    /// The event id is claimed in the receipt log before any state is read.
    /// Redeliveries of finished events are acknowledged as duplicates; a
    /// redelivery racing an active claim fails with
    /// [`BillingError::EventInFlight`] so the provider retries it later.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<ReconcileOutcome> {
        let claim = self
            .events
            .claim(&event, Duration::minutes(PROCESSING_TIMEOUT_MINUTES))
            .await?;

        match claim {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyProcessed(previous_result) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    previous_result = %previous_result,
                    "Duplicate webhook event - already processed"
                );
                return Ok(ReconcileOutcome::Duplicate { previous_result });
            }
            ClaimOutcome::InFlight => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event - currently being processed by another worker"
                );
                return Err(BillingError::EventInFlight(event.id));
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event (claimed exclusive processing rights)"
        );

        let result = self.process_event(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(outcome) => (outcome.processing_result(), None),
            Err(e) => (ProcessingResult::Error, Some(e.to_string())),
        };
        self.record_result(&event, processing_result, error_message.as_deref())
            .await;

        result
    }

    /// Update the receipt, retrying once. A receipt left in `processing`
    /// is reclaimed after the timeout, so failure here is logged, not raised.
    async fn record_result(
        &self,
        event: &WebhookEvent,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) {
        let Err(e) = self.events.complete(&event.id, result, error_message).await else {
            return;
        };

        tracing::warn!(
            event_id = %event.id,
            error = %e,
            "First attempt to update webhook event failed, retrying..."
        );

        if let Err(retry_err) = self.events.complete(&event.id, result, error_message).await {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                processing_result = %result,
                error_message = ?error_message,
                first_error = %e,
                retry_error = %retry_err,
                "CRITICAL: Failed to update webhook audit record after retry. \
                 Event will stay in 'processing' until the claim times out."
            );
        }
    }

    /// Classify and dispatch one event
    async fn process_event(&self, event: &WebhookEvent) -> BillingResult<ReconcileOutcome> {
        let transition = match classify(event) {
            Classification::Transition(transition) => transition,
            Classification::Skipped(reason) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %reason,
                    "Acknowledging webhook event without state change"
                );
                return Ok(ReconcileOutcome::Ignored(reason));
            }
        };

        match &transition {
            Transition::CheckoutCompleted { .. } => {
                self.handle_checkout_completed(event, &transition).await
            }
            Transition::InvoicePaid { .. } => self.handle_invoice_paid(event, &transition).await,
            Transition::InvoicePaymentFailed { .. } => {
                self.handle_invoice_payment_failed(event, &transition).await
            }
            Transition::SubscriptionCancelled { .. } => {
                self.handle_subscription_cancelled(event, &transition).await
            }
            Transition::SubscriptionUpdated { .. } => {
                self.handle_subscription_updated(event, &transition).await
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event: &WebhookEvent,
        transition: &Transition,
    ) -> BillingResult<ReconcileOutcome> {
        let snapshot = self.fetch_snapshot(transition).await?;
        self.reconcile(event, transition, &snapshot, ProjectionSignal::None)
            .await
    }

    async fn handle_invoice_paid(
        &self,
        event: &WebhookEvent,
        transition: &Transition,
    ) -> BillingResult<ReconcileOutcome> {
        if let Some(reason) = self.require_ledger_entry(transition).await? {
            return Ok(ReconcileOutcome::Ignored(reason));
        }
        let snapshot = self.fetch_snapshot(transition).await?;
        self.reconcile(event, transition, &snapshot, ProjectionSignal::None)
            .await
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &WebhookEvent,
        transition: &Transition,
    ) -> BillingResult<ReconcileOutcome> {
        if let Some(reason) = self.require_ledger_entry(transition).await? {
            return Ok(ReconcileOutcome::Ignored(reason));
        }
        let snapshot = self.fetch_snapshot(transition).await?;
        self.reconcile(event, transition, &snapshot, ProjectionSignal::PaymentFailed)
            .await
    }

    async fn handle_subscription_cancelled(
        &self,
        event: &WebhookEvent,
        transition: &Transition,
    ) -> BillingResult<ReconcileOutcome> {
        if let Some(reason) = self.require_ledger_entry(transition).await? {
            return Ok(ReconcileOutcome::Ignored(reason));
        }

        let mut snapshot = self.fetch_snapshot(transition).await?;
        if !is_terminal_status(&snapshot.status) {
            tracing::warn!(
                event_id = %event.id,
                subscription_id = %snapshot.subscription_id,
                status = %snapshot.status,
                "Deletion event for a subscription Stripe still reports as live; recording canceled"
            );
            snapshot.status = "canceled".to_string();
        }

        self.reconcile(event, transition, &snapshot, ProjectionSignal::Cancelled)
            .await
    }

    async fn handle_subscription_updated(
        &self,
        event: &WebhookEvent,
        transition: &Transition,
    ) -> BillingResult<ReconcileOutcome> {
        if let Some(reason) = self.require_ledger_entry(transition).await? {
            return Ok(ReconcileOutcome::Ignored(reason));
        }
        let snapshot = self.fetch_snapshot(transition).await?;
        self.reconcile(event, transition, &snapshot, ProjectionSignal::None)
            .await
    }

    /// Events other than checkout can only act on subscriptions already in
    /// the ledger. Checked before the provider round trip.
    async fn require_ledger_entry(
        &self,
        transition: &Transition,
    ) -> BillingResult<Option<SkipReason>> {
        let subscription_id = transition.subscription_id();
        if self
            .store
            .find_by_provider_subscription_id(subscription_id)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        tracing::info!(
            subscription_id = %subscription_id,
            transition = transition.name(),
            "No ledger entry for subscription; skipping"
        );
        Ok(Some(SkipReason::MissingReference(format!(
            "no ledger entry for subscription {}",
            subscription_id
        ))))
    }

    async fn fetch_snapshot(&self, transition: &Transition) -> BillingResult<SubscriptionSnapshot> {
        let snapshot = self
            .provider
            .fetch_subscription(transition.subscription_id())
            .await?;

        tracing::debug!(
            subscription_id = %snapshot.subscription_id,
            status = %snapshot.status,
            current_period_end = %snapshot.current_period_end,
            "Fetched authoritative subscription state"
        );

        Ok(snapshot)
    }

    /// Apply one transition: ledger upsert, then account projection, in a
    /// single unit of work. Any error drops the unit of work and rolls both
    /// writes back.
    async fn reconcile(
        &self,
        event: &WebhookEvent,
        transition: &Transition,
        snapshot: &SubscriptionSnapshot,
        signal: ProjectionSignal,
    ) -> BillingResult<ReconcileOutcome> {
        let now = OffsetDateTime::now_utc();
        let event_at = event.created_at();

        let mut uow = self.store.begin().await?;
        let mut existing = uow.lock_ledger_entry(&snapshot.subscription_id).await?;
        let mut insert_conflicted = false;

        let (entry, ledger, signal) = loop {
            // A payment failure older than the newest applied event is history
            let signal = match &existing {
                Some(current)
                    if signal == ProjectionSignal::PaymentFailed
                        && !current.accepts_event_at(event_at) =>
                {
                    tracing::info!(
                        event_id = %event.id,
                        subscription_id = %current.stripe_subscription_id,
                        "Ignoring payment failure older than the last applied event"
                    );
                    ProjectionSignal::None
                }
                _ => signal,
            };

            let plan = match plan_upsert(
                existing.as_ref(),
                transition.business_account_id(),
                snapshot,
                event_at,
                now,
            ) {
                Ok(plan) => plan,
                Err(reason) => {
                    tracing::info!(
                        event_id = %event.id,
                        subscription_id = %snapshot.subscription_id,
                        reason = %reason,
                        "Ledger upsert skipped"
                    );
                    return Ok(ReconcileOutcome::Ignored(reason));
                }
            };

            match plan {
                UpsertPlan::Create(entry) => {
                    if uow.insert_ledger_entry(&entry).await? {
                        break (entry, LedgerChange::Created, signal);
                    }
                    if insert_conflicted {
                        return Err(BillingError::Internal(format!(
                            "ledger entry for {} conflicted on insert but could not be locked",
                            snapshot.subscription_id
                        )));
                    }
                    // A concurrent checkout created the row first; plan against it
                    insert_conflicted = true;
                    existing = uow.lock_ledger_entry(&snapshot.subscription_id).await?;
                }
                UpsertPlan::Update(entry) => {
                    uow.update_ledger_entry(&entry).await?;
                    break (entry, LedgerChange::Updated, signal);
                }
                UpsertPlan::Unchanged(entry, reason) => {
                    break (entry, LedgerChange::Unchanged(reason), signal);
                }
            }
        };

        let account = uow
            .lock_business_account(entry.business_account_id)
            .await?
            .ok_or_else(|| {
                tracing::error!(
                    event_id = %event.id,
                    subscription_id = %entry.stripe_subscription_id,
                    business_account_id = %entry.business_account_id,
                    "Ledger entry references a business account that does not exist"
                );
                BillingError::Projection(format!(
                    "business account {} not found for subscription {}",
                    entry.business_account_id, entry.stripe_subscription_id
                ))
            })?;

        let latest = uow.latest_ledger_entry_for_account(account.id).await?;

        let (account_status, account_changed) =
            match plan_projection(&account, &entry, latest.as_ref(), signal, now) {
                ProjectionPlan::Apply(updated) => {
                    uow.update_business_account(&updated).await?;
                    (updated.subscription_status, true)
                }
                ProjectionPlan::Unchanged => (account.subscription_status, false),
                ProjectionPlan::Superseded {
                    latest_subscription_id,
                } => {
                    tracing::info!(
                        event_id = %event.id,
                        subscription_id = %entry.stripe_subscription_id,
                        latest_subscription_id = %latest_subscription_id,
                        business_account_id = %account.id,
                        "Account owned by a newer subscription; not projecting"
                    );
                    (account.subscription_status, false)
                }
            };

        uow.commit().await?;

        tracing::info!(
            event_id = %event.id,
            transition = transition.name(),
            subscription_id = %entry.stripe_subscription_id,
            business_account_id = %account.id,
            ledger = ?ledger,
            status = %account_status,
            account_changed,
            "Subscription transition reconciled"
        );

        Ok(ReconcileOutcome::Applied(AppliedTransition {
            transition: transition.name(),
            subscription_id: entry.stripe_subscription_id,
            business_account_id: account.id,
            ledger,
            account_status,
            account_changed,
        }))
    }

    // ============ WEBHOOK REPLAY FUNCTIONALITY ============

    /// List failed or unfinished webhook events that can be replayed
    pub async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.events
            .list(
                &[
                    ProcessingResult::Error,
                    ProcessingResult::Processing,
                    ProcessingResult::Replaying,
                    ProcessingResult::PendingReplay,
                ],
                limit,
                offset,
            )
            .await
    }

    /// List all webhook events with optional status filter
    pub async fn list_webhooks(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let filter = match status_filter {
            Some(status) => vec![ProcessingResult::parse(status).ok_or_else(|| {
                BillingError::InvalidInput(format!("Unknown processing result: {}", status))
            })?],
            None => Vec::new(),
        };

        self.events.list(&filter, limit, offset).await
    }

    /// Re-run a stored event from classification onwards
    pub async fn replay_webhook(
        &self,
        stripe_event_id: &str,
    ) -> BillingResult<WebhookReplayResult> {
        tracing::info!(
            stripe_event_id = %stripe_event_id,
            "Attempting to replay webhook event"
        );

        let record = self.events.find(stripe_event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!(
                "Webhook event {} not found in database",
                stripe_event_id
            ))
        })?;

        let event: WebhookEvent = serde_json::from_value(record.payload.clone()).map_err(|e| {
            BillingError::MalformedEvent(format!(
                "Stored payload for {} is not a valid event: {}",
                stripe_event_id, e
            ))
        })?;

        let previous_status = record.processing_result;
        let previous_error = record.error_message;

        let claimed = self
            .events
            .mark_replaying(
                stripe_event_id,
                &format!(
                    "Replay initiated. Previous status: {}. Previous error: {}",
                    previous_status,
                    previous_error.as_deref().unwrap_or("none")
                ),
                Duration::minutes(PROCESSING_TIMEOUT_MINUTES),
            )
            .await?;

        if !claimed {
            tracing::info!(
                stripe_event_id = %stripe_event_id,
                previous_status = %previous_status,
                "Replay refused; event is currently being processed"
            );
            return Err(BillingError::EventInFlight(stripe_event_id.to_string()));
        }

        let process_result = self.process_event(&event).await;

        let (new_status, new_error) = match &process_result {
            Ok(outcome) => (outcome.processing_result(), None),
            Err(e) => (ProcessingResult::Error, Some(e.to_string())),
        };

        self.events
            .complete(stripe_event_id, new_status, new_error.as_deref())
            .await?;

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %previous_status,
            new_status = %new_status,
            success = process_result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id: record.id,
            stripe_event_id: stripe_event_id.to_string(),
            event_type: event.event_type,
            previous_status,
            previous_error,
            new_status: new_status.to_string(),
            new_error,
            success: process_result.is_ok(),
        })
    }

    /// Replay failed webhooks, oldest first
    pub async fn replay_all_failed(
        &self,
        max_events: Option<i64>,
    ) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_events.unwrap_or(DEFAULT_REPLAY_LIMIT);
        let failed = self
            .events
            .list(&[ProcessingResult::Error], limit, 0)
            .await?;

        let mut results = Vec::with_capacity(failed.len());

        for record in failed.into_iter().rev() {
            match self.replay_webhook(&record.stripe_event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        stripe_event_id = %record.stripe_event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        record_id: record.id,
                        stripe_event_id: record.stripe_event_id,
                        event_type: record.event_type,
                        previous_status: record.processing_result,
                        previous_error: record.error_message,
                        new_status: ProcessingResult::Error.to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Reset a stuck webhook to allow re-processing
    pub async fn reset_stuck_webhook(&self, stripe_event_id: &str) -> BillingResult<()> {
        if !self.events.reset(stripe_event_id).await? {
            return Err(BillingError::NotFound(format!(
                "Webhook {} not found or not in resettable state",
                stripe_event_id
            )));
        }

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            "Webhook reset for replay"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventData;
    use crate::projector::BusinessAccount;
    use crate::provider::InMemorySubscriptionProvider;
    use crate::store::InMemoryBillingStore;

    const SECRET: &str = "whsec_test_secret";

    struct Harness {
        handler: WebhookHandler,
        store: InMemoryBillingStore,
        provider: InMemorySubscriptionProvider,
    }

    fn harness() -> Harness {
        let store = InMemoryBillingStore::new();
        let provider = InMemorySubscriptionProvider::new();
        let handler = WebhookHandler::new(
            WebhookVerifier::new(SECRET, 300),
            Arc::new(provider.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        );
        Harness {
            handler,
            store,
            provider,
        }
    }

    fn event(id: &str, event_type: &str, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            data: EventData { object },
            livemode: false,
        }
    }

    fn snapshot(status: &str, period_end: OffsetDateTime) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            subscription_id: "sub_1".to_string(),
            status: status.to_string(),
            current_period_start: period_end - Duration::days(30),
            current_period_end: period_end,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_verify_event_uses_configured_secret() {
        let h = harness();
        let body = br#"{"id":"evt_1","type":"invoice.paid","created":1,"data":{"object":{}}}"#;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = WebhookVerifier::new(SECRET, 300).sign(body, now).unwrap();

        let event = h.handler.verify_event(body, &header).unwrap();
        assert_eq!(event.id, "evt_1");

        let forged = WebhookVerifier::new("whsec_other", 300).sign(body, now).unwrap();
        assert!(matches!(
            h.handler.verify_event(body, &forged),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_checkout_activates_account() {
        let h = harness();
        let now = OffsetDateTime::now_utc();
        let account = BusinessAccount::onboard(Uuid::new_v4(), "starter", now);
        h.store.create_business_account(&account).await.unwrap();
        let period_end = now + Duration::days(30);
        h.provider.set(snapshot("active", period_end)).await;

        let outcome = h
            .handler
            .handle_event(event(
                "evt_checkout",
                "checkout.session.completed",
                serde_json::json!({
                    "object": "checkout.session",
                    "mode": "subscription",
                    "subscription": "sub_1",
                    "client_reference_id": account.id.to_string(),
                }),
            ))
            .await
            .unwrap();

        match outcome {
            ReconcileOutcome::Applied(applied) => {
                assert_eq!(applied.ledger, LedgerChange::Created);
                assert_eq!(applied.account_status, SubscriptionStatus::Active);
                assert!(applied.account_changed);
            }
            other => panic!("expected applied, got {:?}", other),
        }

        let stored = h.store.find_business_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.subscription_ends_at, period_end);

        let receipt = h.store.find("evt_checkout").await.unwrap().unwrap();
        assert_eq!(receipt.processing_result, "success");
    }

    #[tokio::test]
    async fn test_unrecognized_event_is_recorded_as_ignored() {
        let h = harness();
        let outcome = h
            .handler
            .handle_event(event("evt_x", "customer.created", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Ignored(SkipReason::UnrecognizedEvent(
                "customer.created".to_string()
            ))
        );
        let receipt = h.store.find("evt_x").await.unwrap().unwrap();
        assert_eq!(receipt.processing_result, "ignored");
    }

    #[tokio::test]
    async fn test_invoice_for_unknown_subscription_skips_fetch() {
        let h = harness();
        // provider has no sub_1, so a fetch would fail
        let outcome = h
            .handler
            .handle_event(event(
                "evt_inv",
                "invoice.paid",
                serde_json::json!({"subscription": "sub_1"}),
            ))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Ignored(SkipReason::MissingReference(_))
        ));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_recorded_and_retryable() {
        let h = harness();
        let now = OffsetDateTime::now_utc();
        let account = BusinessAccount::onboard(Uuid::new_v4(), "starter", now);
        h.store.create_business_account(&account).await.unwrap();

        let checkout = event(
            "evt_checkout",
            "checkout.session.completed",
            serde_json::json!({
                "mode": "subscription",
                "subscription": "sub_1",
                "client_reference_id": account.id.to_string(),
            }),
        );

        let err = h.handler.handle_event(checkout.clone()).await.unwrap_err();
        assert!(matches!(err, BillingError::UpstreamFetch(_)));
        assert!(err.is_retryable());
        assert_eq!(
            h.store.find("evt_checkout").await.unwrap().unwrap().processing_result,
            "error"
        );

        h.provider.set(snapshot("active", now + Duration::days(30))).await;
        let outcome = h.handler.handle_event(checkout).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied(_)));
    }

    #[tokio::test]
    async fn test_list_webhooks_rejects_unknown_status() {
        let h = harness();
        assert!(matches!(
            h.handler.list_webhooks(Some("exploded"), 10, 0).await,
            Err(BillingError::InvalidInput(_))
        ));
        assert!(h.handler.list_webhooks(None, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_unknown_webhook_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.handler.reset_stuck_webhook("evt_missing").await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let outcome = ReconcileOutcome::Ignored(SkipReason::UnrecognizedEvent(
            "customer.created".to_string(),
        ));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "ignored");
        assert_eq!(json["reason"], "unrecognized_event");
        assert_eq!(json["detail"], "customer.created");
    }
}
