//! In-process store for tests and local development
//!
//! A unit of work locks the whole state and edits a staged copy, which
//! replaces the live state on commit. Transactions therefore serialize
//! completely, which is stricter than Postgres row locks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    ClaimOutcome, EventLog, ProcessingResult, ReconciliationStore, UnitOfWork, WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::event::WebhookEvent;
use crate::ledger::LedgerEntry;
use crate::projector::BusinessAccount;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, BusinessAccount>,
    ledger: HashMap<String, LedgerEntry>,
}

#[derive(Clone, Default)]
pub struct InMemoryBillingStore {
    state: Arc<Mutex<MemoryState>>,
    events: Arc<Mutex<HashMap<String, WebhookEventRecord>>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed ledger rows, ordered by subscription id
    pub async fn ledger_entries(&self) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state.ledger.values().cloned().collect();
        entries.sort_by(|a, b| a.stripe_subscription_id.cmp(&b.stripe_subscription_id));
        entries
    }

    /// Overwrite the stored processing start of an event
    pub async fn backdate_event(&self, stripe_event_id: &str, started_at: OffsetDateTime) {
        if let Some(record) = self.events.lock().await.get_mut(stripe_event_id) {
            record.processing_started_at = Some(started_at);
        }
    }
}

#[async_trait]
impl ReconciliationStore for InMemoryBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, staged }))
    }

    async fn find_business_account(&self, id: Uuid) -> BillingResult<Option<BusinessAccount>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn create_business_account(&self, account: &BusinessAccount) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .accounts
            .entry(account.id)
            .or_insert_with(|| account.clone());
        Ok(())
    }

    async fn find_by_provider_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        Ok(self.state.lock().await.ledger.get(subscription_id).cloned())
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_ledger_entry(
        &mut self,
        subscription_id: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        Ok(self.staged.ledger.get(subscription_id).cloned())
    }

    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> BillingResult<bool> {
        if self.staged.ledger.contains_key(&entry.stripe_subscription_id) {
            return Ok(false);
        }
        self.staged
            .ledger
            .insert(entry.stripe_subscription_id.clone(), entry.clone());
        Ok(true)
    }

    async fn update_ledger_entry(&mut self, entry: &LedgerEntry) -> BillingResult<()> {
        match self.staged.ledger.get_mut(&entry.stripe_subscription_id) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!(
                "ledger entry {}",
                entry.stripe_subscription_id
            ))),
        }
    }

    async fn latest_ledger_entry_for_account(
        &mut self,
        business_account_id: Uuid,
    ) -> BillingResult<Option<LedgerEntry>> {
        Ok(self
            .staged
            .ledger
            .values()
            .filter(|entry| entry.business_account_id == business_account_id)
            .max_by_key(|entry| entry.recency())
            .cloned())
    }

    async fn lock_business_account(
        &mut self,
        id: Uuid,
    ) -> BillingResult<Option<BusinessAccount>> {
        Ok(self.staged.accounts.get(&id).cloned())
    }

    async fn update_business_account(&mut self, account: &BusinessAccount) -> BillingResult<()> {
        match self.staged.accounts.get_mut(&account.id) {
            Some(stored) => {
                *stored = account.clone();
                Ok(())
            }
            None => Err(BillingError::Projection(format!(
                "business account {} disappeared during update",
                account.id
            ))),
        }
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryUnitOfWork { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl EventLog for InMemoryBillingStore {
    async fn claim(
        &self,
        event: &WebhookEvent,
        stale_after: Duration,
    ) -> BillingResult<ClaimOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut events = self.events.lock().await;

        if let Some(record) = events.get_mut(&event.id) {
            if record.is_reclaimable(now, stale_after) {
                record.error_message = Some(format!(
                    "Reclaimed from {} at {}",
                    record.processing_result, now
                ));
                record.processing_result = ProcessingResult::Processing.to_string();
                record.processing_started_at = Some(now);
                return Ok(ClaimOutcome::Claimed);
            }

            return Ok(match ProcessingResult::parse(&record.processing_result) {
                Some(result) if result.is_final() => ClaimOutcome::AlreadyProcessed(result),
                _ => ClaimOutcome::InFlight,
            });
        }

        let payload = serde_json::to_value(event)
            .map_err(|e| BillingError::Internal(format!("Failed to encode event: {}", e)))?;
        events.insert(
            event.id.clone(),
            WebhookEventRecord {
                id: Uuid::new_v4(),
                stripe_event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                event_timestamp: event.created_at(),
                payload,
                processing_result: ProcessingResult::Processing.to_string(),
                processing_started_at: Some(now),
                error_message: None,
                created_at: now,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut events = self.events.lock().await;
        let record = events
            .get_mut(stripe_event_id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", stripe_event_id)))?;
        record.processing_result = result.to_string();
        record.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn find(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.events.lock().await.get(stripe_event_id).cloned())
    }

    async fn list(
        &self,
        results: &[ProcessingResult],
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let events = self.events.lock().await;
        let mut records: Vec<WebhookEventRecord> = events
            .values()
            .filter(|record| {
                results.is_empty()
                    || results
                        .iter()
                        .any(|r| r.as_str() == record.processing_result)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn mark_replaying(
        &self,
        stripe_event_id: &str,
        note: &str,
        stale_after: Duration,
    ) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut events = self.events.lock().await;
        let record = events
            .get_mut(stripe_event_id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", stripe_event_id)))?;

        let in_progress = ProcessingResult::parse(&record.processing_result)
            .is_some_and(|result| result.is_in_progress());
        if in_progress && !record.is_reclaimable(now, stale_after) {
            return Ok(false);
        }

        record.processing_result = ProcessingResult::Replaying.to_string();
        record.processing_started_at = Some(now);
        record.error_message = Some(note.to_string());
        Ok(true)
    }

    async fn reset(&self, stripe_event_id: &str) -> BillingResult<bool> {
        let mut events = self.events.lock().await;
        let Some(record) = events.get_mut(stripe_event_id) else {
            return Ok(false);
        };

        match ProcessingResult::parse(&record.processing_result) {
            Some(ProcessingResult::Processing)
            | Some(ProcessingResult::Replaying)
            | Some(ProcessingResult::Error) => {
                record.processing_result = ProcessingResult::PendingReplay.to_string();
                record.error_message =
                    Some(format!("Reset for replay at {}", OffsetDateTime::now_utc()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventData;

    fn event(id: &str) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: "invoice.paid".to_string(),
            created: 1_767_225_600,
            data: EventData {
                object: serde_json::json!({"subscription": "sub_1"}),
            },
            livemode: false,
        }
    }

    fn entry(subscription_id: &str, account: Uuid) -> LedgerEntry {
        let now = OffsetDateTime::now_utc();
        LedgerEntry {
            id: Uuid::new_v4(),
            stripe_subscription_id: subscription_id.to_string(),
            business_account_id: account,
            status: "active".to_string(),
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            provider_created_at: now,
            last_event_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_unit_of_work_is_discarded() {
        let store = InMemoryBillingStore::new();
        {
            let mut uow = store.begin().await.unwrap();
            assert!(uow
                .insert_ledger_entry(&entry("sub_1", Uuid::new_v4()))
                .await
                .unwrap());
        }
        assert!(store
            .find_by_provider_subscription_id("sub_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = InMemoryBillingStore::new();
        let mut uow = store.begin().await.unwrap();
        uow.insert_ledger_entry(&entry("sub_1", Uuid::new_v4()))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        assert!(store
            .find_by_provider_subscription_id("sub_1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_insert_reports_conflict() {
        let store = InMemoryBillingStore::new();
        let mut uow = store.begin().await.unwrap();
        assert!(uow
            .insert_ledger_entry(&entry("sub_1", Uuid::new_v4()))
            .await
            .unwrap());
        assert!(!uow
            .insert_ledger_entry(&entry("sub_1", Uuid::new_v4()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_latest_entry_follows_provider_creation_time() {
        let store = InMemoryBillingStore::new();
        let account = Uuid::new_v4();
        let newer = entry("sub_2", account);
        let mut older = entry("sub_1", account);
        older.provider_created_at = newer.provider_created_at - Duration::days(30);
        // the older subscription's row is written last
        older.created_at = newer.created_at + Duration::minutes(5);

        let mut uow = store.begin().await.unwrap();
        uow.insert_ledger_entry(&newer).await.unwrap();
        uow.insert_ledger_entry(&older).await.unwrap();

        let latest = uow
            .latest_ledger_entry_for_account(account)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.stripe_subscription_id, "sub_2");
    }

    #[tokio::test]
    async fn test_replay_claim_waits_for_fresh_processing() {
        let store = InMemoryBillingStore::new();
        let delivery = event("evt_1");
        store.claim(&delivery, Duration::minutes(30)).await.unwrap();

        assert!(!store
            .mark_replaying("evt_1", "replay", Duration::minutes(30))
            .await
            .unwrap());

        store
            .complete("evt_1", ProcessingResult::Error, Some("boom"))
            .await
            .unwrap();
        assert!(store
            .mark_replaying("evt_1", "replay", Duration::minutes(30))
            .await
            .unwrap());
        assert_eq!(
            store.find("evt_1").await.unwrap().unwrap().processing_result,
            "replaying"
        );
    }

    #[tokio::test]
    async fn test_claim_lifecycle() {
        let store = InMemoryBillingStore::new();
        let evt = event("evt_1");
        let stale = Duration::minutes(30);

        assert_eq!(store.claim(&evt, stale).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.claim(&evt, stale).await.unwrap(), ClaimOutcome::InFlight);

        store
            .complete("evt_1", ProcessingResult::Success, None)
            .await
            .unwrap();
        assert_eq!(
            store.claim(&evt, stale).await.unwrap(),
            ClaimOutcome::AlreadyProcessed(ProcessingResult::Success)
        );
    }

    #[tokio::test]
    async fn test_failed_and_stale_events_are_reclaimed() {
        let store = InMemoryBillingStore::new();
        let stale = Duration::minutes(30);

        let failed = event("evt_failed");
        store.claim(&failed, stale).await.unwrap();
        store
            .complete("evt_failed", ProcessingResult::Error, Some("boom"))
            .await
            .unwrap();
        assert_eq!(store.claim(&failed, stale).await.unwrap(), ClaimOutcome::Claimed);

        let stuck = event("evt_stuck");
        store.claim(&stuck, stale).await.unwrap();
        store
            .backdate_event("evt_stuck", OffsetDateTime::now_utc() - Duration::hours(1))
            .await;
        assert_eq!(store.claim(&stuck, stale).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_reset_only_applies_to_unfinished_events() {
        let store = InMemoryBillingStore::new();
        let stale = Duration::minutes(30);

        store.claim(&event("evt_1"), stale).await.unwrap();
        assert!(store.reset("evt_1").await.unwrap());
        let record = store.find("evt_1").await.unwrap().unwrap();
        assert_eq!(record.processing_result, "pending_replay");

        store.claim(&event("evt_2"), stale).await.unwrap();
        store
            .complete("evt_2", ProcessingResult::Success, None)
            .await
            .unwrap();
        assert!(!store.reset("evt_2").await.unwrap());
        assert!(!store.reset("evt_missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_result() {
        let store = InMemoryBillingStore::new();
        let stale = Duration::minutes(30);

        store.claim(&event("evt_ok"), stale).await.unwrap();
        store
            .complete("evt_ok", ProcessingResult::Success, None)
            .await
            .unwrap();
        store.claim(&event("evt_bad"), stale).await.unwrap();
        store
            .complete("evt_bad", ProcessingResult::Error, Some("boom"))
            .await
            .unwrap();

        let failed = store
            .list(&[ProcessingResult::Error], 10, 0)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].stripe_event_id, "evt_bad");

        assert_eq!(store.list(&[], 10, 0).await.unwrap().len(), 2);
        assert_eq!(store.list(&[], 1, 0).await.unwrap().len(), 1);
    }
}
