//! Billing Invariants Module
//!
//! Runnable consistency checks over the ledger, the business accounts and
//! the webhook receipt log. Checks only read. Run them after a replay or an
//! incident to confirm the reconciled state is coherent.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::is_terminal_status;
use crate::projector::{project, ProjectionSignal, SubscriptionStatus};
use crate::webhooks::PROCESSING_TIMEOUT_MINUTES;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Business account(s) affected
    pub business_account_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Account has access it should not have, or state cannot be resolved
    Critical,
    /// Account state disagrees with the ledger
    High,
    /// Needs operator attention
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// True when no check reported a violation
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateLedgerRow {
    stripe_subscription_id: String,
    entry_count: i64,
    business_account_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct LatestEntryRow {
    business_account_id: Uuid,
    account_status: String,
    stripe_subscription_id: String,
    entry_status: String,
    current_period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanedEntryRow {
    stripe_subscription_id: String,
    business_account_id: Uuid,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_result: String,
    processing_started_at: Option<OffsetDateTime>,
    error_message: Option<String>,
}

/// Account status the latest ledger entry implies, when it implies one.
///
/// A past-due account behind an active entry is accepted: a payment failure
/// moves the account before Stripe's own status catches up.
fn expected_account_status(
    account_status: SubscriptionStatus,
    entry_status: &str,
    period_end: OffsetDateTime,
) -> Option<SubscriptionStatus> {
    let expected = project(entry_status, ProjectionSignal::None, period_end)?.status;
    if expected == account_status {
        return None;
    }
    if expected == SubscriptionStatus::Active && account_status == SubscriptionStatus::PastDue {
        return None;
    }
    Some(expected)
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_single_ledger_entry_per_subscription().await?);
        violations.extend(self.check_account_status_matches_latest_entry().await?);
        violations.extend(self.check_cancelled_entry_account_not_active().await?);
        violations.extend(self.check_ledger_account_exists().await?);
        violations.extend(self.check_stuck_webhook_events().await?);

        Ok(summarize(Self::available_checks().len(), violations))
    }

    /// Invariant 1: At most one ledger entry per Stripe subscription id
    ///
    /// Guarded by a unique index; a hit here means the schema drifted.
    async fn check_single_ledger_entry_per_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateLedgerRow> = sqlx::query_as(
            r#"
            SELECT stripe_subscription_id,
                   COUNT(*) AS entry_count,
                   ARRAY_AGG(DISTINCT business_account_id) AS business_account_ids
            FROM subscriptions
            GROUP BY stripe_subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_ledger_entry_per_subscription".to_string(),
                business_account_ids: row.business_account_ids,
                description: format!(
                    "Subscription {} has {} ledger entries (expected 1)",
                    row.stripe_subscription_id, row.entry_count
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "entry_count": row.entry_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn latest_entries(&self) -> BillingResult<Vec<LatestEntryRow>> {
        let rows: Vec<LatestEntryRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (s.business_account_id)
                s.business_account_id,
                a.subscription_status AS account_status,
                s.stripe_subscription_id,
                s.status AS entry_status,
                s.current_period_end
            FROM subscriptions s
            JOIN business_accounts a ON a.id = s.business_account_id
            ORDER BY s.business_account_id,
                     s.provider_created_at DESC, s.created_at DESC, s.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Invariant 2: Account status agrees with its latest non-terminal entry
    async fn check_account_status_matches_latest_entry(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();

        for row in self.latest_entries().await? {
            if is_terminal_status(&row.entry_status) {
                continue;
            }
            let account_status: SubscriptionStatus = row.account_status.parse()?;
            let Some(expected) =
                expected_account_status(account_status, &row.entry_status, row.current_period_end)
            else {
                continue;
            };

            violations.push(InvariantViolation {
                invariant: "account_status_matches_latest_entry".to_string(),
                business_account_ids: vec![row.business_account_id],
                description: format!(
                    "Account is '{}' but subscription {} ({}) implies '{}'",
                    account_status, row.stripe_subscription_id, row.entry_status, expected
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "entry_status": row.entry_status,
                    "account_status": account_status,
                    "expected_status": expected,
                }),
                severity: ViolationSeverity::High,
            });
        }

        Ok(violations)
    }

    /// Invariant 3: An account whose latest entry is terminal has no access
    async fn check_cancelled_entry_account_not_active(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();

        for row in self.latest_entries().await? {
            if !is_terminal_status(&row.entry_status) {
                continue;
            }
            let account_status: SubscriptionStatus = row.account_status.parse()?;
            if account_status == SubscriptionStatus::Cancelled {
                continue;
            }

            violations.push(InvariantViolation {
                invariant: "cancelled_entry_account_not_active".to_string(),
                business_account_ids: vec![row.business_account_id],
                description: format!(
                    "Subscription {} is {} but the account is still '{}'",
                    row.stripe_subscription_id, row.entry_status, account_status
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "entry_status": row.entry_status,
                    "account_status": account_status,
                }),
                severity: ViolationSeverity::Critical,
            });
        }

        Ok(violations)
    }

    /// Invariant 4: Every ledger entry references an existing account
    async fn check_ledger_account_exists(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanedEntryRow> = sqlx::query_as(
            r#"
            SELECT s.stripe_subscription_id, s.business_account_id, s.status
            FROM subscriptions s
            LEFT JOIN business_accounts a ON a.id = s.business_account_id
            WHERE a.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_account_exists".to_string(),
                business_account_ids: vec![row.business_account_id],
                description: format!(
                    "Subscription {} references missing business account {}",
                    row.stripe_subscription_id, row.business_account_id
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: No webhook receipts failed or abandoned mid-processing
    async fn check_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_result,
                   processing_started_at, error_message
            FROM stripe_webhook_events
            WHERE processing_result = 'error'
               OR (processing_result IN ('processing', 'replaying')
                   AND processing_started_at < NOW() - make_interval(mins => $1))
            ORDER BY created_at ASC
            "#,
        )
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stuck_webhook_events".to_string(),
                business_account_ids: Vec::new(),
                description: format!(
                    "Webhook {} ({}) is '{}' and needs replay",
                    row.stripe_event_id, row.event_type, row.processing_result
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "processing_started_at": row.processing_started_at,
                    "error_message": row.error_message,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<InvariantCheckSummary> {
        let violations = match name {
            "single_ledger_entry_per_subscription" => {
                self.check_single_ledger_entry_per_subscription().await
            }
            "account_status_matches_latest_entry" => {
                self.check_account_status_matches_latest_entry().await
            }
            "cancelled_entry_account_not_active" => {
                self.check_cancelled_entry_account_not_active().await
            }
            "ledger_account_exists" => self.check_ledger_account_exists().await,
            "stuck_webhook_events" => self.check_stuck_webhook_events().await,
            _ => {
                return Err(BillingError::InvalidInput(format!(
                    "Unknown invariant check: {}",
                    name
                )))
            }
        }?;

        Ok(summarize(1, violations))
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_ledger_entry_per_subscription",
            "account_status_matches_latest_entry",
            "cancelled_entry_account_not_active",
            "ledger_account_exists",
            "stuck_webhook_events",
        ]
    }
}

fn summarize(checks_run: usize, violations: Vec<InvariantViolation>) -> InvariantCheckSummary {
    let checks_failed = violations
        .iter()
        .map(|v| &v.invariant)
        .collect::<std::collections::HashSet<_>>()
        .len();

    if !violations.is_empty() {
        tracing::warn!(
            checks_failed,
            violations = violations.len(),
            "Billing invariant violations found"
        );
    }

    InvariantCheckSummary {
        checked_at: OffsetDateTime::now_utc(),
        checks_run,
        checks_passed: checks_run.saturating_sub(checks_failed),
        checks_failed,
        healthy: violations.is_empty(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const END: OffsetDateTime = datetime!(2026-02-01 00:00 UTC);

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"ledger_account_exists"));
        assert!(checks.contains(&"stuck_webhook_events"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let violation = |invariant: &str| InvariantViolation {
            invariant: invariant.to_string(),
            business_account_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        };

        let summary = summarize(
            5,
            vec![
                violation("ledger_account_exists"),
                violation("ledger_account_exists"),
                violation("stuck_webhook_events"),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);

        let clean = summarize(1, Vec::new());
        assert_eq!(clean.checks_passed, 1);
        assert!(clean.healthy);
    }

    #[test]
    fn test_expected_status_flags_trial_behind_active_entry() {
        assert_eq!(
            expected_account_status(SubscriptionStatus::Trial, "active", END),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            expected_account_status(SubscriptionStatus::Active, "past_due", END),
            Some(SubscriptionStatus::PastDue)
        );
    }

    #[test]
    fn test_expected_status_tolerates_payment_failure_ahead_of_stripe() {
        assert_eq!(
            expected_account_status(SubscriptionStatus::PastDue, "active", END),
            None
        );
        assert_eq!(
            expected_account_status(SubscriptionStatus::Active, "trialing", END),
            None
        );
        // no projection for incomplete subscriptions
        assert_eq!(
            expected_account_status(SubscriptionStatus::Trial, "incomplete", END),
            None
        );
    }
}
