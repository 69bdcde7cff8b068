//! Subscription status analysis.
//!
//! A pure, read-only diagnosis of a user's subscription health, consumed
//! by the engine's logs and by operator tooling. Never throws, never
//! blocks, never caches: everything is recomputed from the record and the
//! supplied clock.

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::EngineConfig;
use crate::store::{SubscriptionStatus, UserSubscriptionRecord};

/// Days before expiry at which renewal reminders start appearing in the
/// recommendations.
const EXPIRY_REMINDER_DAYS: i64 = 7;

/// Derived subscription health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionAnalysis {
    pub is_active: bool,
    pub is_expired: bool,
    pub is_pending_cancellation: bool,
    pub days_until_expiry: Option<i64>,
    pub status_reason: String,
    pub recommendations: Vec<String>,
}

impl SubscriptionAnalysis {
    fn inactive(reason: &str) -> Self {
        Self {
            is_active: false,
            is_expired: false,
            is_pending_cancellation: false,
            days_until_expiry: None,
            status_reason: reason.to_string(),
            recommendations: Vec::new(),
        }
    }
}

/// Analyze a user record at the given instant.
///
/// "Pending cancellation" and "active but expiring" are not mutually
/// exclusive here even though the persisted status enum keeps them apart:
/// a user inside the tolerance window still has service, so the report
/// shows both facts.
pub fn analyze(
    user: &UserSubscriptionRecord,
    now: OffsetDateTime,
    config: &EngineConfig,
) -> SubscriptionAnalysis {
    // Free tier: nothing else matters.
    if !user.plan_tier.is_paid() {
        let mut analysis = SubscriptionAnalysis::inactive("free plan");
        analysis
            .recommendations
            .push("upgrade to a paid plan to unlock client galleries".to_string());
        return analysis;
    }

    let mut analysis = SubscriptionAnalysis::inactive("");

    match user.subscription_status {
        SubscriptionStatus::PendingCancellation => {
            analysis.is_pending_cancellation = true;
            analysis.status_reason = format!(
                "cancellation received, downgrade scheduled after the {}-day tolerance window",
                config.tolerance_window_days
            );
        }
        SubscriptionStatus::PaymentFailed => {
            analysis.is_expired = true;
            analysis.status_reason =
                "subscription suspended after a critical payment failure".to_string();
            analysis
                .recommendations
                .push("update the payment method and complete a new purchase".to_string());
            return analysis;
        }
        SubscriptionStatus::Inactive => {
            analysis.status_reason = "subscription status is inactive".to_string();
            return analysis;
        }
        SubscriptionStatus::Active => {}
    }

    match user.subscription_end_date {
        Some(end) => {
            let remaining = end - now;
            if remaining <= time::Duration::ZERO {
                analysis.is_expired = true;
                analysis.is_active = false;
                analysis.days_until_expiry = Some(remaining.whole_days());
                analysis.status_reason = "subscription period has ended".to_string();
                analysis
                    .recommendations
                    .push("complete a new purchase to reactivate the plan".to_string());
            } else {
                // Expiry in the future never means inactive: renewal is
                // assumed automatic unless a cancellation said otherwise.
                let days = remaining.whole_days();
                analysis.is_active = true;
                analysis.days_until_expiry = Some(days);
                if analysis.status_reason.is_empty() {
                    analysis.status_reason = format!("active, renews in {} day(s)", days);
                }
                if days <= EXPIRY_REMINDER_DAYS {
                    analysis
                        .recommendations
                        .push("renewal is approaching, confirm the payment method is current".to_string());
                }
            }
        }
        None => {
            if user.subscription_status == SubscriptionStatus::Active {
                analysis.is_active = true;
                if analysis.status_reason.is_empty() {
                    analysis.status_reason = "active with no scheduled end date".to_string();
                }
            }
        }
    }

    // A pending downgrade refines the report even when the expiry rules
    // already marked the user active.
    if let Some(pending) = &user.pending_downgrade {
        analysis.is_pending_cancellation = true;
        let days_left = (pending.scheduled_for - now).whole_days().max(0);
        analysis.status_reason = format!(
            "downgrade to the free tier scheduled in {} day(s): {}",
            days_left, pending.reason
        );
        if analysis.days_until_expiry.is_none() {
            analysis.days_until_expiry = Some(days_left);
        }
        analysis
            .recommendations
            .push("a successful payment before the scheduled date cancels the downgrade".to_string());
    }

    analysis
}
