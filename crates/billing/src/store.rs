//! User subscription records and the external collaborator seams.
//!
//! Persistence and notification delivery are not this engine's business:
//! it talks to a key-value user record store and a fire-and-forget
//! notifier through the traits below. The in-memory implementations back
//! tests and single-process deployments; production plugs a database
//! adapter into the same seam.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::CanonicalEvent;
use crate::offers::PlanTier;

/// Persisted subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PendingCancellation,
    PaymentFailed,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PendingCancellation => "pending_cancellation",
            SubscriptionStatus::PaymentFailed => "payment_failed",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "pending_cancellation" => SubscriptionStatus::PendingCancellation,
            "payment_failed" => SubscriptionStatus::PaymentFailed,
            _ => SubscriptionStatus::Inactive,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A downgrade scheduled for the end of the tolerance window.
///
/// Only present while `subscription_status` is `PendingCancellation`;
/// cleared together with any transition out of that status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDowngrade {
    pub scheduled_for: OffsetDateTime,
    pub reason: String,
    pub original_plan: PlanTier,
}

/// The last canonical event applied to a user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastEvent {
    pub kind: CanonicalEvent,
    pub timestamp: OffsetDateTime,
}

/// A photographer's subscription record, as persisted by the user store.
///
/// Mutated exclusively through the state machine (administrative
/// overrides use the same primitives); never deleted by this subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSubscriptionRecord {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub plan_tier: PlanTier,
    pub subscription_status: SubscriptionStatus,
    pub subscription_start_date: Option<OffsetDateTime>,
    pub subscription_end_date: Option<OffsetDateTime>,
    pub pending_downgrade: Option<PendingDowngrade>,
    /// Support-granted upgrade outside the payment flow.
    pub is_manual_activation: bool,
    pub manual_activation_date: Option<OffsetDateTime>,
    pub last_event: Option<LastEvent>,
    /// Plan held before a forced downgrade, kept for manual restoration.
    pub previous_plan: Option<PlanTier>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserSubscriptionRecord {
    /// A brand-new free-tier record, as created at registration time or by
    /// the engine's new-customer path.
    pub fn new_free(email: &str, name: Option<String>, phone: Option<String>, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.trim().to_lowercase(),
            name,
            phone,
            plan_tier: PlanTier::Free,
            subscription_status: SubscriptionStatus::Inactive,
            subscription_start_date: None,
            subscription_end_date: None,
            pending_downgrade: None,
            is_manual_activation: false,
            manual_activation_date: None,
            last_event: None,
            previous_plan: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// User store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not found: {0}")]
    NotFound(String),
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Key-value user record store (external collaborator).
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_email(&self, email: &str) -> Result<Option<UserSubscriptionRecord>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<UserSubscriptionRecord>, StoreError>;

    async fn create(
        &self,
        record: UserSubscriptionRecord,
    ) -> Result<UserSubscriptionRecord, StoreError>;

    /// Replace the stored record with the given one (matched by id). The
    /// engine computes the full next state in memory and commits it in
    /// this single call.
    async fn update(
        &self,
        record: UserSubscriptionRecord,
    ) -> Result<UserSubscriptionRecord, StoreError>;

    async fn list_users(&self) -> Result<Vec<UserSubscriptionRecord>, StoreError>;
}

/// Outbound notification delivery (external collaborator).
///
/// Every call is fire-and-forget from the engine's point of view:
/// failures are logged and never block or fail webhook processing.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_welcome(
        &self,
        email: &str,
        name: Option<&str>,
        temporary_credential: &str,
    ) -> Result<(), NotifyError>;

    async fn send_cancellation_scheduled(
        &self,
        email: &str,
        scheduled_for: OffsetDateTime,
    ) -> Result<(), NotifyError>;

    async fn send_downgraded(&self, email: &str, previous_plan: PlanTier) -> Result<(), NotifyError>;

    async fn send_payment_failed(&self, email: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// In-memory user store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryUserStore {
    records: RwLock<HashMap<Uuid, UserSubscriptionRecord>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_by_email(&self, email: &str) -> Result<Option<UserSubscriptionRecord>, StoreError> {
        let needle = email.trim().to_lowercase();
        let records = self.records.read().await;
        Ok(records.values().find(|r| r.email == needle).cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<UserSubscriptionRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn create(
        &self,
        record: UserSubscriptionRecord,
    ) -> Result<UserSubscriptionRecord, StoreError> {
        let mut records = self.records.write().await;
        if records.values().any(|r| r.email == record.email) {
            return Err(StoreError::Conflict(format!(
                "email already registered: {}",
                record.email
            )));
        }
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        record: UserSubscriptionRecord,
    ) -> Result<UserSubscriptionRecord, StoreError> {
        let mut records = self.records.write().await;
        if !records.contains_key(&record.id) {
            return Err(StoreError::NotFound(record.id.to_string()));
        }
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_users(&self) -> Result<Vec<UserSubscriptionRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// Notifier that records the notification in the log instead of
/// delivering it. Used when no delivery backend is configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send_welcome(
        &self,
        email: &str,
        name: Option<&str>,
        _temporary_credential: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!(email = %email, name = ?name, "Welcome notification (log only)");
        Ok(())
    }

    async fn send_cancellation_scheduled(
        &self,
        email: &str,
        scheduled_for: OffsetDateTime,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            email = %email,
            scheduled_for = %scheduled_for,
            "Cancellation-scheduled notification (log only)"
        );
        Ok(())
    }

    async fn send_downgraded(&self, email: &str, previous_plan: PlanTier) -> Result<(), NotifyError> {
        tracing::info!(
            email = %email,
            previous_plan = %previous_plan,
            "Downgrade notification (log only)"
        );
        Ok(())
    }

    async fn send_payment_failed(&self, email: &str) -> Result<(), NotifyError> {
        tracing::info!(email = %email, "Payment-failed notification (log only)");
        Ok(())
    }
}
