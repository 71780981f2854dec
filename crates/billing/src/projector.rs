//! Business account projection
//!
//! Derives the business-facing subscription status from a ledger entry and
//! writes it onto the account the entry belongs to.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingError;
use crate::ledger::{is_terminal_status, LedgerEntry};

/// Length of the trial granted at onboarding
pub const TRIAL_PERIOD_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(BillingError::InvalidInput(format!(
                "Unknown subscription status: {}",
                other
            ))),
        }
    }
}

/// Locally owned business account (`business_accounts` table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusinessAccount {
    pub id: Uuid,
    pub subscription_status: SubscriptionStatus,
    pub subscription_tier: String,
    pub subscription_ends_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl BusinessAccount {
    /// New account on the onboarding trial
    pub fn onboard(id: Uuid, tier: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            id,
            subscription_status: SubscriptionStatus::Trial,
            subscription_tier: tier.into(),
            subscription_ends_at: now + Duration::days(TRIAL_PERIOD_DAYS),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Event-level hint layered on top of the provider status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionSignal {
    None,
    PaymentFailed,
    Cancelled,
}

/// Target account fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    pub status: SubscriptionStatus,
    /// New period end; `None` leaves the stored value alone
    pub ends_at: Option<OffsetDateTime>,
}

/// Map a raw provider status plus signal onto account fields
pub fn project(
    raw_status: &str,
    signal: ProjectionSignal,
    period_end: OffsetDateTime,
) -> Option<Projection> {
    if signal == ProjectionSignal::Cancelled || is_terminal_status(raw_status) {
        return Some(Projection {
            status: SubscriptionStatus::Cancelled,
            ends_at: None,
        });
    }

    if signal == ProjectionSignal::PaymentFailed {
        return Some(Projection {
            status: SubscriptionStatus::PastDue,
            ends_at: None,
        });
    }

    match raw_status {
        "active" | "trialing" => Some(Projection {
            status: SubscriptionStatus::Active,
            ends_at: Some(period_end),
        }),
        "past_due" | "unpaid" | "paused" => Some(Projection {
            status: SubscriptionStatus::PastDue,
            ends_at: None,
        }),
        other => {
            tracing::info!(
                provider_status = %other,
                "Provider status has no account projection"
            );
            None
        }
    }
}

/// Result of planning an account write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionPlan {
    Apply(BusinessAccount),
    Unchanged,
    /// A newer ledger entry owns the account's state
    Superseded { latest_subscription_id: String },
}

/// Plan the account write for `entry`.
///
/// `latest` is the account's ledger entry for the subscription Stripe
/// created most recently. Entries other than the latest never touch the
/// account, so a late event for a replaced subscription cannot overwrite its
/// successor, whatever order the rows were inserted in.
pub fn plan_projection(
    account: &BusinessAccount,
    entry: &LedgerEntry,
    latest: Option<&LedgerEntry>,
    signal: ProjectionSignal,
    now: OffsetDateTime,
) -> ProjectionPlan {
    if let Some(latest) = latest {
        if latest.stripe_subscription_id != entry.stripe_subscription_id {
            return ProjectionPlan::Superseded {
                latest_subscription_id: latest.stripe_subscription_id.clone(),
            };
        }
    }

    let Some(projection) = project(&entry.status, signal, entry.current_period_end) else {
        return ProjectionPlan::Unchanged;
    };

    let ends_at = projection.ends_at.unwrap_or(account.subscription_ends_at);
    if account.subscription_status == projection.status && account.subscription_ends_at == ends_at
    {
        return ProjectionPlan::Unchanged;
    }

    ProjectionPlan::Apply(BusinessAccount {
        subscription_status: projection.status,
        subscription_ends_at: ends_at,
        updated_at: now,
        ..account.clone()
    })
}
