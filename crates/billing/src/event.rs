//! Webhook event envelope and lifecycle classification
//!
//! Events are parsed into a thin envelope that keeps `data.object` as raw
//! JSON. Classification pulls out only the linking identifiers each
//! transition needs; everything else about the subscription is re-fetched
//! from Stripe before it is trusted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";

/// Metadata key set on checkout sessions that carries the business account id
pub const BUSINESS_ACCOUNT_METADATA_KEY: &str = "business_account_id";

/// Stripe event envelope as delivered to the webhook endpoint
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebhookEvent {
    /// Unique event identifier (evt_...)
    pub id: String,

    /// Event type, e.g. "invoice.paid"
    #[serde(rename = "type")]
    pub event_type: String,

    /// Unix timestamp of event creation
    #[serde(default)]
    pub created: i64,

    pub data: EventData,

    #[serde(default)]
    pub livemode: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EventData {
    /// The checkout session, invoice or subscription affected by the event
    pub object: Value,
}

impl WebhookEvent {
    /// Event creation time, falling back to now for missing or invalid values
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

/// Recognized lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    CheckoutCompleted {
        business_account_id: Uuid,
        subscription_id: String,
    },
    InvoicePaid {
        subscription_id: String,
    },
    InvoicePaymentFailed {
        subscription_id: String,
    },
    SubscriptionCancelled {
        subscription_id: String,
    },
    SubscriptionUpdated {
        subscription_id: String,
    },
}

impl Transition {
    pub fn subscription_id(&self) -> &str {
        match self {
            Transition::CheckoutCompleted {
                subscription_id, ..
            }
            | Transition::InvoicePaid { subscription_id }
            | Transition::InvoicePaymentFailed { subscription_id }
            | Transition::SubscriptionCancelled { subscription_id }
            | Transition::SubscriptionUpdated { subscription_id } => subscription_id,
        }
    }

    /// Business account carried by the event, if any. Only checkout sessions
    /// link a subscription to an account.
    pub fn business_account_id(&self) -> Option<Uuid> {
        match self {
            Transition::CheckoutCompleted {
                business_account_id,
                ..
            } => Some(*business_account_id),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::CheckoutCompleted { .. } => "checkout_completed",
            Transition::InvoicePaid { .. } => "invoice_paid",
            Transition::InvoicePaymentFailed { .. } => "invoice_payment_failed",
            Transition::SubscriptionCancelled { .. } => "subscription_cancelled",
            Transition::SubscriptionUpdated { .. } => "subscription_updated",
        }
    }
}

/// Why an authenticated event was acknowledged without changing state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Event type outside the handled set
    UnrecognizedEvent(String),
    /// Event lacks the linking field its transition requires
    MissingReference(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UnrecognizedEvent(event_type) => {
                write!(f, "unrecognized event type {}", event_type)
            }
            SkipReason::MissingReference(detail) => write!(f, "missing reference: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Transition(Transition),
    Skipped(SkipReason),
}

/// Map a verified event onto a transition
pub fn classify(event: &WebhookEvent) -> Classification {
    let object = &event.data.object;

    let result = match event.event_type.as_str() {
        CHECKOUT_SESSION_COMPLETED => classify_checkout(object),
        INVOICE_PAID | INVOICE_PAYMENT_SUCCEEDED => invoice_subscription(object)
            .map(|subscription_id| Transition::InvoicePaid { subscription_id }),
        INVOICE_PAYMENT_FAILED => invoice_subscription(object)
            .map(|subscription_id| Transition::InvoicePaymentFailed { subscription_id }),
        SUBSCRIPTION_DELETED => subscription_object_id(object)
            .map(|subscription_id| Transition::SubscriptionCancelled { subscription_id }),
        SUBSCRIPTION_UPDATED => subscription_object_id(object)
            .map(|subscription_id| Transition::SubscriptionUpdated { subscription_id }),
        other => Err(SkipReason::UnrecognizedEvent(other.to_string())),
    };

    match result {
        Ok(transition) => Classification::Transition(transition),
        Err(reason) => Classification::Skipped(reason),
    }
}

fn classify_checkout(session: &Value) -> Result<Transition, SkipReason> {
    if session.get("mode").and_then(Value::as_str) != Some("subscription") {
        return Err(SkipReason::MissingReference(
            "checkout session is not in subscription mode".to_string(),
        ));
    }

    let subscription_id = session
        .get("subscription")
        .and_then(expandable_id)
        .ok_or_else(|| {
            SkipReason::MissingReference("checkout session has no subscription".to_string())
        })?;

    let raw_account_id = session
        .get("client_reference_id")
        .and_then(Value::as_str)
        .or_else(|| {
            session
                .get("metadata")
                .and_then(|m| m.get(BUSINESS_ACCOUNT_METADATA_KEY))
                .and_then(Value::as_str)
        })
        .ok_or_else(|| {
            SkipReason::MissingReference(
                "checkout session has no business account reference".to_string(),
            )
        })?;

    let business_account_id = Uuid::parse_str(raw_account_id).map_err(|_| {
        SkipReason::MissingReference(format!(
            "checkout session business account reference is not a valid id: {}",
            raw_account_id
        ))
    })?;

    Ok(Transition::CheckoutCompleted {
        business_account_id,
        subscription_id,
    })
}

/// Subscription referenced by an invoice. Newer API versions move it under
/// `parent.subscription_details`.
fn invoice_subscription(invoice: &Value) -> Result<String, SkipReason> {
    invoice
        .get("subscription")
        .and_then(expandable_id)
        .or_else(|| {
            invoice
                .pointer("/parent/subscription_details/subscription")
                .and_then(expandable_id)
        })
        .ok_or_else(|| SkipReason::MissingReference("invoice has no subscription".to_string()))
}

fn subscription_object_id(object: &Value) -> Result<String, SkipReason> {
    if object.get("object").and_then(Value::as_str) != Some("subscription") {
        return Err(SkipReason::MissingReference(
            "event payload is not a subscription".to_string(),
        ));
    }

    object
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| SkipReason::MissingReference("subscription has no id".to_string()))
}

/// Stripe fields may hold either an id string or an expanded object
fn expandable_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(map) => map
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        _ => None,
    }
}
