// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider and database messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tradepost Billing Module
//!
//! Reconciles Stripe subscription lifecycle webhooks into local state.
//!
//! ## Features
//!
//! - **Authentication**: Stripe-Signature verification over the raw body
//! - **Classification**: Checkout, invoice and subscription events mapped to transitions
//! - **Ledger**: One idempotent, order-tolerant row per Stripe subscription
//! - **Projection**: Business account status derived from the latest ledger entry
//! - **Receipts**: Exactly-once processing per event id with operator replay
//! - **Invariants**: Read-only consistency checks over the reconciled state

pub mod client;
pub mod error;
pub mod event;
pub mod invariants;
pub mod ledger;
pub mod projector;
pub mod provider;
pub mod signature;
pub mod store;
pub mod webhooks;


// Client
pub use client::{StripeClient, StripeConfig, DEFAULT_SIGNATURE_TOLERANCE_SECS};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use event::{classify, Classification, SkipReason, Transition, WebhookEvent};

// Ledger
pub use ledger::{plan_upsert, LedgerEntry, SubscriptionSnapshot, UnchangedReason, UpsertPlan};

// Projector
pub use projector::{
    plan_projection, project, BusinessAccount, Projection, ProjectionPlan, ProjectionSignal,
    SubscriptionStatus, TRIAL_PERIOD_DAYS,
};

// Provider
pub use provider::{
    InMemorySubscriptionProvider, StripeSubscriptionProvider, SubscriptionProvider,
};

// Signature
pub use signature::{SignatureHeader, WebhookVerifier};

// Store
pub use store::{
    ClaimOutcome, EventLog, InMemoryBillingStore, PgBillingStore, ProcessingResult,
    ReconciliationStore, UnitOfWork, WebhookEventRecord,
};

// Webhooks
pub use webhooks::{
    AppliedTransition, LedgerChange, ReconcileOutcome, WebhookHandler, WebhookReplayResult,
    PROCESSING_TIMEOUT_MINUTES,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub webhooks: WebhookHandler,
    /// Only available on Postgres-backed deployments
    pub invariants: Option<InvariantChecker>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        Self {
            webhooks: WebhookHandler::from_stripe(stripe, PgBillingStore::new(pool.clone())),
            invariants: Some(InvariantChecker::new(pool)),
        }
    }

    /// Wrap a custom-wired handler
    pub fn with_handler(webhooks: WebhookHandler) -> Self {
        Self {
            webhooks,
            invariants: None,
        }
    }
}
