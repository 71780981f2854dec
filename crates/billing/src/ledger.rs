//! Subscription ledger
//!
//! One row per Stripe subscription id, mirroring the latest provider-reported
//! status and billing period. Rows are created by the first checkout that
//! links a subscription to a business account and then only updated in place.
//!
//! Write decisions are made by [`plan_upsert`], which is pure; persistence
//! adapters only execute the resulting plan.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::event::SkipReason;

/// Statuses after which Stripe never revives a subscription id
pub fn is_terminal_status(status: &str) -> bool {
    matches!(status, "canceled" | "cancelled" | "incomplete_expired")
}

/// Persisted ledger row (`subscriptions` table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub business_account_id: Uuid,
    /// Provider status, verbatim
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    /// When Stripe created the subscription. Ranks subscriptions of one account.
    pub provider_created_at: OffsetDateTime,
    /// Creation time of the newest event applied to this row
    pub last_event_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl LedgerEntry {
    pub fn is_terminal(&self) -> bool {
        is_terminal_status(&self.status)
    }

    /// Whether an event created at `event_at` is at least as new as anything
    /// already applied to this row
    pub fn accepts_event_at(&self, event_at: OffsetDateTime) -> bool {
        self.last_event_at.map_or(true, |last| event_at >= last)
    }

    /// Ordering key among one account's rows; the greatest is its latest
    /// subscription. Local insertion time only breaks ties.
    pub fn recency(&self) -> (OffsetDateTime, OffsetDateTime, Uuid) {
        (self.provider_created_at, self.created_at, self.id)
    }
}

/// Authoritative subscription state as fetched from Stripe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Why an upsert left the row untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnchangedReason {
    /// Snapshot matches what is stored
    Identical,
    /// Snapshot reports an older billing period than the stored one
    Stale,
    /// Stored status is terminal
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertPlan {
    Create(LedgerEntry),
    Update(LedgerEntry),
    Unchanged(LedgerEntry, UnchangedReason),
}

impl UpsertPlan {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            UpsertPlan::Create(entry) | UpsertPlan::Update(entry) => entry,
            UpsertPlan::Unchanged(entry, _) => entry,
        }
    }
}

/// Decide how a snapshot lands in the ledger.
///
/// `business_account_id` is only known for checkout events; without it a
/// missing row cannot be created and the event is skipped.
pub fn plan_upsert(
    existing: Option<&LedgerEntry>,
    business_account_id: Option<Uuid>,
    snapshot: &SubscriptionSnapshot,
    event_at: OffsetDateTime,
    now: OffsetDateTime,
) -> Result<UpsertPlan, SkipReason> {
    let Some(current) = existing else {
        let business_account_id = business_account_id.ok_or_else(|| {
            SkipReason::MissingReference(format!(
                "no ledger entry for subscription {}",
                snapshot.subscription_id
            ))
        })?;

        return Ok(UpsertPlan::Create(LedgerEntry {
            id: Uuid::new_v4(),
            stripe_subscription_id: snapshot.subscription_id.clone(),
            business_account_id,
            status: snapshot.status.clone(),
            current_period_start: snapshot.current_period_start,
            current_period_end: snapshot.current_period_end,
            provider_created_at: snapshot.created_at,
            last_event_at: Some(event_at),
            created_at: now,
            updated_at: now,
        }));
    };

    if let Some(account_id) = business_account_id {
        if account_id != current.business_account_id {
            tracing::warn!(
                subscription_id = %current.stripe_subscription_id,
                stored_account_id = %current.business_account_id,
                event_account_id = %account_id,
                "Event names a different business account than the ledger; keeping the original"
            );
        }
    }

    if current.is_terminal() {
        return Ok(UpsertPlan::Unchanged(
            current.clone(),
            UnchangedReason::Terminal,
        ));
    }

    let last_event_at = match current.last_event_at {
        Some(last) if last >= event_at => Some(last),
        _ => Some(event_at),
    };

    // Termination always lands; a lagging read must not keep the row live
    if is_terminal_status(&snapshot.status) {
        return Ok(UpsertPlan::Update(LedgerEntry {
            status: snapshot.status.clone(),
            current_period_start: current
                .current_period_start
                .max(snapshot.current_period_start),
            current_period_end: current.current_period_end.max(snapshot.current_period_end),
            last_event_at,
            updated_at: now,
            ..current.clone()
        }));
    }

    if snapshot.current_period_end < current.current_period_end {
        return Ok(UpsertPlan::Unchanged(current.clone(), UnchangedReason::Stale));
    }

    if current.status == snapshot.status
        && current.current_period_start == snapshot.current_period_start
        && current.current_period_end == snapshot.current_period_end
        && current.last_event_at == last_event_at
    {
        return Ok(UpsertPlan::Unchanged(
            current.clone(),
            UnchangedReason::Identical,
        ));
    }

    Ok(UpsertPlan::Update(LedgerEntry {
        status: snapshot.status.clone(),
        current_period_start: snapshot.current_period_start,
        current_period_end: snapshot.current_period_end,
        last_event_at,
        updated_at: now,
        ..current.clone()
    }))
}
