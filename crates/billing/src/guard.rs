//! Downgrade safety guard.
//!
//! A wrong downgrade costs a paying customer; a missed one costs pennies
//! until the next delivery. The guard inspects a user's recent history
//! before any downgrade and vetoes the ones most likely to be webhook
//! races or stale deliveries, without blocking legitimate downgrades
//! indefinitely.
//!
//! Rule order matters and is part of the contract:
//!
//! 1. Already on the free tier: nothing to downgrade.
//! 2. Refund or chargeback: always allowed past this point. Money already
//!    left the platform; no protection window outweighs that.
//! 3. Manual activation within the grace period: vetoed. Support-granted
//!    access must not be clobbered by a stale webhook.
//! 4. Successful purchase within the race window: vetoed. An out-of-order
//!    cancellation racing its own approval is the usual cause.
//! 5. Cancellation-class event that survived rules 3-4: allowed.

use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::events::CanonicalEvent;
use crate::store::UserSubscriptionRecord;

/// Verdict on a proposed downgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: String,
}

impl GuardDecision {
    fn allow(reason: &str) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
        }
    }
}

/// Decide whether `event` may downgrade `user` right now.
pub fn may_downgrade(
    user: &UserSubscriptionRecord,
    event: &CanonicalEvent,
    now: OffsetDateTime,
    config: &EngineConfig,
) -> GuardDecision {
    if !user.plan_tier.is_paid() {
        return GuardDecision::deny("user is already on the free tier");
    }

    if event.is_financial_loss() {
        return GuardDecision::allow("financial-loss event, downgrade always proceeds");
    }

    if user.is_manual_activation {
        if let Some(activated_at) = user.manual_activation_date {
            if now - activated_at < config.manual_activation_grace() {
                return GuardDecision::deny(
                    "manual activation is within its grace period, refusing automatic downgrade",
                );
            }
        }
    }

    if let Some(last) = &user.last_event {
        if last.kind.is_approval() && now - last.timestamp < config.approval_race_guard() {
            return GuardDecision::deny(
                "successful payment recorded within the race window, cancellation looks out of order",
            );
        }
    }

    if event.is_cancellation() {
        return GuardDecision::allow("cancellation honored after safety checks");
    }

    GuardDecision::deny("event is not a downgrade trigger")
}
