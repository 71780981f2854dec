//! Persistence seams for reconciliation
//!
//! [`ReconciliationStore`] hands out a [`UnitOfWork`] per event; the ledger
//! write and the account write both go through it and land together on
//! [`UnitOfWork::commit`]. Dropping a unit of work without committing
//! discards everything it wrote.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::event::WebhookEvent;
use crate::ledger::LedgerEntry;
use crate::projector::BusinessAccount;

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn begin(&self) -> BillingResult<Box<dyn UnitOfWork>>;

    async fn find_business_account(&self, id: Uuid) -> BillingResult<Option<BusinessAccount>>;

    /// Onboarding entry point for the surrounding application
    async fn create_business_account(&self, account: &BusinessAccount) -> BillingResult<()>;

    async fn find_by_provider_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<LedgerEntry>>;
}

/// One event's writes. Row locks taken here are held until commit or drop.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Load and lock the ledger row for `subscription_id`
    async fn lock_ledger_entry(
        &mut self,
        subscription_id: &str,
    ) -> BillingResult<Option<LedgerEntry>>;

    /// Insert a new row. Returns `false` when a concurrent writer created the
    /// same subscription id first.
    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> BillingResult<bool>;

    async fn update_ledger_entry(&mut self, entry: &LedgerEntry) -> BillingResult<()>;

    /// Most recently created ledger row referencing the account
    async fn latest_ledger_entry_for_account(
        &mut self,
        business_account_id: Uuid,
    ) -> BillingResult<Option<LedgerEntry>>;

    async fn lock_business_account(&mut self, id: Uuid)
        -> BillingResult<Option<BusinessAccount>>;

    async fn update_business_account(&mut self, account: &BusinessAccount) -> BillingResult<()>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}

/// Processing state of a received webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    Processing,
    Replaying,
    Success,
    Ignored,
    Error,
    PendingReplay,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Replaying => "replaying",
            ProcessingResult::Success => "success",
            ProcessingResult::Ignored => "ignored",
            ProcessingResult::Error => "error",
            ProcessingResult::PendingReplay => "pending_replay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ProcessingResult::Processing),
            "replaying" => Some(ProcessingResult::Replaying),
            "success" => Some(ProcessingResult::Success),
            "ignored" => Some(ProcessingResult::Ignored),
            "error" => Some(ProcessingResult::Error),
            "pending_replay" => Some(ProcessingResult::PendingReplay),
            _ => None,
        }
    }

    /// Finished states that make a redelivery a duplicate
    pub fn is_final(&self) -> bool {
        matches!(self, ProcessingResult::Success | ProcessingResult::Ignored)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ProcessingResult::Processing | ProcessingResult::Replaying
        )
    }
}

impl std::fmt::Display for ProcessingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of trying to claim an event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Already finished with the given result
    AlreadyProcessed(ProcessingResult),
    /// Another worker holds a fresh claim
    InFlight,
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub payload: serde_json::Value,
    pub processing_result: String,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

impl WebhookEventRecord {
    /// Whether the record can be claimed again at `now`
    pub fn is_reclaimable(&self, now: OffsetDateTime, stale_after: Duration) -> bool {
        match ProcessingResult::parse(&self.processing_result) {
            Some(ProcessingResult::Error) | Some(ProcessingResult::PendingReplay) => true,
            Some(result) if result.is_in_progress() => self
                .processing_started_at
                .map_or(true, |started| started < now - stale_after),
            _ => false,
        }
    }
}

/// Receipt log of authenticated webhook events
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Atomically claim exclusive processing rights for `event`.
    ///
    /// New events are inserted as `processing`. Existing records are
    /// reclaimed when they ended in `error`, were reset for replay, or have
    /// been `processing` for longer than `stale_after`.
    async fn claim(
        &self,
        event: &WebhookEvent,
        stale_after: Duration,
    ) -> BillingResult<ClaimOutcome>;

    async fn complete(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn find(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Newest first, optionally filtered to the given results
    async fn list(
        &self,
        results: &[ProcessingResult],
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Claim a stored event for operator replay. Returns `false` while
    /// another worker holds a claim younger than `stale_after`.
    async fn mark_replaying(
        &self,
        stripe_event_id: &str,
        note: &str,
        stale_after: Duration,
    ) -> BillingResult<bool>;

    /// Move a stuck or failed event to `pending_replay`. Returns `false` if
    /// no such event is in a resettable state.
    async fn reset(&self, stripe_event_id: &str) -> BillingResult<bool>;
}
