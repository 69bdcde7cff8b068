//! Administrative read API.
//!
//! Operator dashboards list users by subscription health category; each
//! row pairs the persisted record with its on-demand analysis. Read-only.

use serde::Serialize;
use time::OffsetDateTime;

use crate::analyzer::{analyze, SubscriptionAnalysis};
use crate::config::EngineConfig;
use crate::store::{StoreError, SubscriptionStatus, UserStore, UserSubscriptionRecord};

/// Days-to-expiry threshold for the "expiring soon" category.
const EXPIRING_SOON_DAYS: i64 = 7;

/// Operator-facing user categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserCategory {
    Active,
    ExpiringSoon,
    Expired,
    PendingCancellation,
    PaymentFailed,
    Free,
}

impl UserCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserCategory::Active => "active",
            UserCategory::ExpiringSoon => "expiring_soon",
            UserCategory::Expired => "expired",
            UserCategory::PendingCancellation => "pending_cancellation",
            UserCategory::PaymentFailed => "payment_failed",
            UserCategory::Free => "free",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(UserCategory::Active),
            "expiring_soon" => Some(UserCategory::ExpiringSoon),
            "expired" => Some(UserCategory::Expired),
            "pending_cancellation" => Some(UserCategory::PendingCancellation),
            "payment_failed" => Some(UserCategory::PaymentFailed),
            "free" => Some(UserCategory::Free),
            _ => None,
        }
    }
}

impl std::fmt::Display for UserCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user record joined with its current analysis.
#[derive(Debug, Clone, Serialize)]
pub struct CategorizedUser {
    pub record: UserSubscriptionRecord,
    pub analysis: SubscriptionAnalysis,
}

/// List every user falling into `category` at instant `now`.
pub async fn list_users_by_category(
    store: &dyn UserStore,
    category: UserCategory,
    now: OffsetDateTime,
    config: &EngineConfig,
) -> Result<Vec<CategorizedUser>, StoreError> {
    let users = store.list_users().await?;
    let mut matching = Vec::new();

    for record in users {
        let analysis = analyze(&record, now, config);
        let belongs = match category {
            UserCategory::Active => analysis.is_active,
            UserCategory::ExpiringSoon => {
                analysis.is_active
                    && analysis
                        .days_until_expiry
                        .is_some_and(|days| days <= EXPIRING_SOON_DAYS)
            }
            UserCategory::Expired => analysis.is_expired,
            UserCategory::PendingCancellation => analysis.is_pending_cancellation,
            UserCategory::PaymentFailed => {
                record.subscription_status == SubscriptionStatus::PaymentFailed
            }
            UserCategory::Free => !record.plan_tier.is_paid(),
        };
        if belongs {
            matching.push(CategorizedUser { record, analysis });
        }
    }

    // Stable ordering for dashboards.
    matching.sort_by(|a, b| a.record.email.cmp(&b.record.email));
    Ok(matching)
}
