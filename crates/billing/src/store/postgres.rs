//! Postgres persistence
//!
//! Each unit of work is one transaction. The ledger row is locked with
//! `SELECT ... FOR UPDATE` so concurrent events for the same subscription
//! serialize, while different subscriptions never contend.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    ClaimOutcome, EventLog, ProcessingResult, ReconciliationStore, UnitOfWork, WebhookEventRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::event::WebhookEvent;
use crate::ledger::LedgerEntry;
use crate::projector::BusinessAccount;

const LEDGER_COLUMNS: &str = "id, stripe_subscription_id, business_account_id, status, \
     current_period_start, current_period_end, provider_created_at, last_event_at, \
     created_at, updated_at";

const EVENT_COLUMNS: &str = "id, stripe_event_id, event_type, event_timestamp, payload, \
     processing_result, processing_started_at, error_message, created_at";

#[derive(Debug, sqlx::FromRow)]
struct BusinessAccountRow {
    id: Uuid,
    subscription_status: String,
    subscription_tier: String,
    subscription_ends_at: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<BusinessAccountRow> for BusinessAccount {
    type Error = BillingError;

    fn try_from(row: BusinessAccountRow) -> Result<Self, Self::Error> {
        Ok(BusinessAccount {
            id: row.id,
            subscription_status: row.subscription_status.parse()?,
            subscription_tier: row.subscription_tier,
            subscription_ends_at: row.subscription_ends_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed ledger, account and receipt storage
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ReconciliationStore for PgBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn find_business_account(&self, id: Uuid) -> BillingResult<Option<BusinessAccount>> {
        let row: Option<BusinessAccountRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_status, subscription_tier, subscription_ends_at,
                   created_at, updated_at
            FROM business_accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BusinessAccount::try_from).transpose()
    }

    async fn create_business_account(&self, account: &BusinessAccount) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO business_accounts (
                id, subscription_status, subscription_tier, subscription_ends_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account.id)
        .bind(account.subscription_status.as_str())
        .bind(&account.subscription_tier)
        .bind(account.subscription_ends_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_provider_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        let entry: Option<LedgerEntry> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1",
            LEDGER_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }
}

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_ledger_entry(
        &mut self,
        subscription_id: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        let entry: Option<LedgerEntry> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1 FOR UPDATE",
            LEDGER_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(entry)
    }

    async fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> BillingResult<bool> {
        // ON CONFLICT waits for a concurrent inserter of the same id to finish
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, stripe_subscription_id, business_account_id, status,
                current_period_start, current_period_end, provider_created_at,
                last_event_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_subscription_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.stripe_subscription_id)
        .bind(entry.business_account_id)
        .bind(&entry.status)
        .bind(entry.current_period_start)
        .bind(entry.current_period_end)
        .bind(entry.provider_created_at)
        .bind(entry.last_event_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_ledger_entry(&mut self, entry: &LedgerEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2,
                current_period_start = $3,
                current_period_end = $4,
                last_event_at = $5,
                updated_at = $6
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(&entry.stripe_subscription_id)
        .bind(&entry.status)
        .bind(entry.current_period_start)
        .bind(entry.current_period_end)
        .bind(entry.last_event_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn latest_ledger_entry_for_account(
        &mut self,
        business_account_id: Uuid,
    ) -> BillingResult<Option<LedgerEntry>> {
        let entry: Option<LedgerEntry> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE business_account_id = $1
            ORDER BY provider_created_at DESC, created_at DESC, id DESC
            LIMIT 1
            "#,
            LEDGER_COLUMNS
        ))
        .bind(business_account_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(entry)
    }

    async fn lock_business_account(
        &mut self,
        id: Uuid,
    ) -> BillingResult<Option<BusinessAccount>> {
        let row: Option<BusinessAccountRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_status, subscription_tier, subscription_ends_at,
                   created_at, updated_at
            FROM business_accounts
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(BusinessAccount::try_from).transpose()
    }

    async fn update_business_account(&mut self, account: &BusinessAccount) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE business_accounts
            SET subscription_status = $2,
                subscription_ends_at = $3,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(account.id)
        .bind(account.subscription_status.as_str())
        .bind(account.subscription_ends_at)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::Projection(format!(
                "business account {} disappeared during update",
                account.id
            )));
        }

        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl EventLog for PgBillingStore {
    async fn claim(
        &self,
        event: &WebhookEvent,
        stale_after: Duration,
    ) -> BillingResult<ClaimOutcome> {
        let payload = serde_json::to_value(event)
            .map_err(|e| BillingError::Internal(format!("Failed to encode event: {}", e)))?;
        let stale_minutes = stale_after.whole_minutes() as i32;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (id, stripe_event_id, event_type, event_timestamp, payload,
                 processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Reclaimed from ', stripe_webhook_events.processing_result,
                                       ' at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result IN ('error', 'pending_replay')
               OR (stripe_webhook_events.processing_result IN ('processing', 'replaying')
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $6))
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event.created_at())
        .bind(payload)
        .bind(stale_minutes)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(&event.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(
            match existing.and_then(|(status,)| ProcessingResult::parse(&status)) {
                Some(result) if result.is_final() => ClaimOutcome::AlreadyProcessed(result),
                _ => ClaimOutcome::InFlight,
            },
        )
    }

    async fn complete(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, stripe_event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let record: Option<WebhookEventRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM stripe_webhook_events WHERE stripe_event_id = $1",
            EVENT_COLUMNS
        ))
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list(
        &self,
        results: &[ProcessingResult],
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = if results.is_empty() {
            sqlx::query_as(&format!(
                r#"
                SELECT {} FROM stripe_webhook_events
                ORDER BY created_at DESC
                LIMIT $1 OFFSET $2
                "#,
                EVENT_COLUMNS
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        } else {
            let filter: Vec<String> = results.iter().map(|r| r.as_str().to_string()).collect();
            sqlx::query_as(&format!(
                r#"
                SELECT {} FROM stripe_webhook_events
                WHERE processing_result = ANY($1)
                ORDER BY created_at DESC
                LIMIT $2 OFFSET $3
                "#,
                EVENT_COLUMNS
            ))
            .bind(filter)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(records)
    }

    async fn mark_replaying(
        &self,
        stripe_event_id: &str,
        note: &str,
        stale_after: Duration,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'replaying',
                processing_started_at = NOW(),
                error_message = $2
            WHERE stripe_event_id = $1
              AND NOT (processing_result IN ('processing', 'replaying')
                       AND processing_started_at >= NOW() - make_interval(mins => $3))
            "#,
        )
        .bind(stripe_event_id)
        .bind(note)
        .bind(stale_after.whole_minutes() as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset(&self, stripe_event_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'pending_replay',
                error_message = CONCAT('Reset for replay at ', NOW()::TEXT)
            WHERE stripe_event_id = $1
              AND processing_result IN ('processing', 'replaying', 'error')
            "#,
        )
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
