//! Event normalization.
//!
//! Providers spell the same logical event many ways (case variants,
//! regional synonyms, dotted vs underscored forms). This module maps that
//! open vocabulary onto the closed set of canonical events the state
//! machine consumes. Adding a newly discovered spelling is a one-line
//! table change; the state machine never needs to know.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Canonical webhook event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalEvent {
    PurchaseApproved,
    PurchaseRefunded,
    PurchaseChargeback,
    PurchaseCanceled,
    SubscriptionCanceled,
    /// Not mapped by the alias table; carries the raw provider string for
    /// diagnostics.
    Unsupported(String),
}

impl CanonicalEvent {
    pub fn as_str(&self) -> &str {
        match self {
            CanonicalEvent::PurchaseApproved => "purchase_approved",
            CanonicalEvent::PurchaseRefunded => "purchase_refunded",
            CanonicalEvent::PurchaseChargeback => "purchase_chargeback",
            CanonicalEvent::PurchaseCanceled => "purchase_canceled",
            CanonicalEvent::SubscriptionCanceled => "subscription_canceled",
            CanonicalEvent::Unsupported(_) => "unsupported",
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self, CanonicalEvent::PurchaseApproved)
    }

    /// Refunds and chargebacks: money already left the platform.
    pub fn is_financial_loss(&self) -> bool {
        matches!(
            self,
            CanonicalEvent::PurchaseRefunded | CanonicalEvent::PurchaseChargeback
        )
    }

    /// Cancellation-class events; these schedule a downgrade rather than
    /// applying one immediately, and do not require a resolved offer.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            CanonicalEvent::PurchaseCanceled | CanonicalEvent::SubscriptionCanceled
        )
    }

    /// Any event that can end in a downgrade.
    pub fn is_downgrade_trigger(&self) -> bool {
        self.is_financial_loss() || self.is_cancellation()
    }
}

impl std::fmt::Display for CanonicalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanonicalEvent::Unsupported(raw) => write!(f, "unsupported({})", raw),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Raw provider spellings, as declared by each provider's documentation or
/// observed in production traffic. Lookup is case-insensitive (exact form,
/// then upper, then lower), so each spelling appears once.
static EVENT_ALIASES: Lazy<HashMap<&'static str, CanonicalEvent>> = Lazy::new(|| {
    use CanonicalEvent::*;
    HashMap::from([
        // Approvals
        ("PURCHASE_APPROVED", PurchaseApproved),
        ("PURCHASE_COMPLETE", PurchaseApproved),
        ("PURCHASE_COMPLETED", PurchaseApproved),
        ("purchase.approved", PurchaseApproved),
        ("APPROVED", PurchaseApproved),
        ("PAYMENT_APPROVED", PurchaseApproved),
        ("COMPRA_APROVADA", PurchaseApproved),
        // Refunds
        ("PURCHASE_REFUNDED", PurchaseRefunded),
        ("purchase.refunded", PurchaseRefunded),
        ("REFUNDED", PurchaseRefunded),
        ("REFUND", PurchaseRefunded),
        ("REEMBOLSO", PurchaseRefunded),
        // Chargebacks
        ("PURCHASE_CHARGEBACK", PurchaseChargeback),
        ("purchase.chargeback", PurchaseChargeback),
        ("CHARGEBACK", PurchaseChargeback),
        ("DISPUTE_OPENED", PurchaseChargeback),
        // One-off purchase cancellations
        ("PURCHASE_CANCELED", PurchaseCanceled),
        ("PURCHASE_CANCELLED", PurchaseCanceled),
        ("purchase.canceled", PurchaseCanceled),
        ("CANCELED", PurchaseCanceled),
        ("CANCELLED", PurchaseCanceled),
        ("COMPRA_CANCELADA", PurchaseCanceled),
        // Subscription cancellations
        ("SUBSCRIPTION_CANCELLATION", SubscriptionCanceled),
        ("SUBSCRIPTION_CANCELED", SubscriptionCanceled),
        ("SUBSCRIPTION_CANCELLED", SubscriptionCanceled),
        ("subscription.canceled", SubscriptionCanceled),
        ("CANCELAMENTO_ASSINATURA", SubscriptionCanceled),
        ("ASSINATURA_CANCELADA", SubscriptionCanceled),
    ])
});

/// Map a raw provider event name onto a canonical event.
///
/// Lookup tries the exact spelling, then the uppercase form, then the
/// lowercase form. Anything unmatched becomes [`CanonicalEvent::Unsupported`]
/// with the original string preserved.
pub fn normalize(raw_event_name: &str) -> CanonicalEvent {
    let trimmed = raw_event_name.trim();

    if let Some(found) = EVENT_ALIASES.get(trimmed) {
        return found.clone();
    }
    if let Some(found) = EVENT_ALIASES.get(trimmed.to_uppercase().as_str()) {
        return found.clone();
    }
    if let Some(found) = EVENT_ALIASES.get(trimmed.to_lowercase().as_str()) {
        return found.clone();
    }

    CanonicalEvent::Unsupported(trimmed.to_string())
}
