//! Subscription event processing engine.
//!
//! The pipeline for one inbound webhook: verify the signature when one is
//! expected, parse the body, extract identity and normalize the event,
//! resolve the offer, claim the idempotency key, and drive the state
//! machine. The state transition and its side effects are computed fully
//! in memory and committed through a single user-store call; nothing
//! partial is ever persisted.
//!
//! Providers retry aggressively on anything but an acknowledgment, so
//! every irregular-but-understood input (unsupported event, unresolvable
//! offer, duplicate delivery) is acknowledged as accepted with a no-op.
//! Only a user-store failure is surfaced as retryable.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::{distr::Alphanumeric, Rng};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::ProcessingResult;
use crate::events::{normalize, CanonicalEvent};
use crate::guard::may_downgrade;
use crate::idempotency::{ClaimResult, IdempotencyKey, IdempotencyLedger};
use crate::offers::{OfferCatalog, OfferResolver, PlanTier, ResolvedOffer};
use crate::payload::PayloadScanner;
use crate::store::{
    LastEvent, Notifier, PendingDowngrade, SubscriptionStatus, UserStore, UserSubscriptionRecord,
};

type HmacSha256 = Hmac<Sha256>;

const TEMPORARY_CREDENTIAL_LEN: usize = 16;

/// Classification of a handled delivery.
///
/// The accepted kinds are acknowledged so the provider stops retrying;
/// the rejected kinds map to a 4xx-class response (redelivery of the same
/// body cannot succeed either).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// A state transition was applied.
    Processed,
    /// Understood but deliberately without effect (unsupported event,
    /// test purchase, no valid offer, nothing to change).
    Ignored,
    /// Idempotency hit; same acknowledgment as the original processing.
    Duplicate,
    /// Body was not a JSON object.
    MalformedPayload,
    /// No customer email anywhere in the payload.
    IdentityNotFound,
    /// Missing or wrong signature.
    SignatureRejected,
}

/// Acknowledgment returned to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookOutcome {
    pub accepted: bool,
    pub kind: OutcomeKind,
    pub message: String,
}

impl WebhookOutcome {
    fn processed(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            kind: OutcomeKind::Processed,
            message: message.into(),
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            kind: OutcomeKind::Ignored,
            message: message.into(),
        }
    }

    fn duplicate(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            kind: OutcomeKind::Duplicate,
            message: message.into(),
        }
    }

    fn rejected(kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            kind,
            message: message.into(),
        }
    }
}

/// Statistics from one tolerance-window expiry sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepStats {
    pub examined: usize,
    pub downgraded: usize,
    pub failed: usize,
}

/// Side effect attached to a planned transition, dispatched after commit.
enum Notification {
    Welcome {
        name: Option<String>,
        temporary_credential: String,
    },
    CancellationScheduled {
        scheduled_for: OffsetDateTime,
    },
    PaymentFailed,
}

/// A fully computed next state, ready to commit.
struct TransitionPlan {
    updated: UserSubscriptionRecord,
    message: String,
    notification: Option<Notification>,
}

enum PlannedTransition {
    Commit(TransitionPlan),
    NoOp { message: String },
}

/// Serializes concurrent transitions per customer. Two webhooks for the
/// same email must not interleave their read-modify-write cycles.
#[derive(Default)]
struct UserLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    async fn acquire(&self, email: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks
                .entry(email.to_lowercase())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// The subscription event processing engine.
pub struct SubscriptionEngine {
    config: EngineConfig,
    scanner: PayloadScanner,
    resolver: OfferResolver,
    ledger: IdempotencyLedger,
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    locks: UserLocks,
}

impl SubscriptionEngine {
    pub fn new(
        config: EngineConfig,
        catalog: OfferCatalog,
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let scanner = PayloadScanner::new(config.scan_depth_limit);
        let ledger = IdempotencyLedger::new(
            config.idempotency_retention(),
            config.idempotency_capacity,
        );
        Self {
            config,
            scanner,
            resolver: OfferResolver::new(catalog),
            ledger,
            store,
            notifier,
            locks: UserLocks::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Operational introspection into the duplicate-detection window.
    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Process one webhook delivery against the current wall clock.
    pub async fn process_webhook(
        &self,
        raw_body: &str,
        signature: Option<&str>,
    ) -> ProcessingResult<WebhookOutcome> {
        self.process_webhook_at(raw_body, signature, OffsetDateTime::now_utc())
            .await
    }

    /// Process one webhook delivery at an explicit instant. Tests and
    /// replay tooling inject the clock here.
    pub async fn process_webhook_at(
        &self,
        raw_body: &str,
        signature: Option<&str>,
        now: OffsetDateTime,
    ) -> ProcessingResult<WebhookOutcome> {
        if let Some(secret) = self.config.webhook_secret.clone() {
            match signature {
                Some(sig) => {
                    if !verify_signature(raw_body, sig, &secret) {
                        tracing::error!("Webhook signature mismatch");
                        return Ok(WebhookOutcome::rejected(
                            OutcomeKind::SignatureRejected,
                            "signature verification failed",
                        ));
                    }
                }
                None if self.config.strict_signatures => {
                    tracing::error!("Unsigned webhook refused in strict mode");
                    return Ok(WebhookOutcome::rejected(
                        OutcomeKind::SignatureRejected,
                        "signature required",
                    ));
                }
                None => {
                    tracing::warn!("Unsigned webhook accepted outside strict mode");
                }
            }
        }

        let payload: Value = match serde_json::from_str(raw_body) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "Webhook body is not valid JSON");
                return Ok(WebhookOutcome::rejected(
                    OutcomeKind::MalformedPayload,
                    "payload is not valid JSON",
                ));
            }
        };
        if !payload.is_object() {
            return Ok(WebhookOutcome::rejected(
                OutcomeKind::MalformedPayload,
                "payload is not a JSON object",
            ));
        }

        let event = match self.scanner.find_event_name(&payload) {
            Some(raw_name) => normalize(&raw_name),
            None => {
                tracing::info!("No event name found in payload, ignoring delivery");
                return Ok(WebhookOutcome::ignored("no event name in payload"));
            }
        };

        if let CanonicalEvent::Unsupported(raw) = &event {
            // Acknowledge so the provider stops retrying; the raw name is
            // logged for alias-table maintenance.
            tracing::info!(raw_event = %raw, "Unsupported event type, ignoring delivery");
            return Ok(WebhookOutcome::ignored(format!(
                "unsupported event type '{}'",
                raw
            )));
        }

        let email = match self.scanner.find_email(&payload) {
            Some(email) => email,
            None => {
                // Full payload goes to the log for manual triage.
                tracing::error!(
                    event = %event,
                    payload = %raw_body,
                    "No customer email found in payload"
                );
                return Ok(WebhookOutcome::rejected(
                    OutcomeKind::IdentityNotFound,
                    "no customer identity found in payload",
                ));
            }
        };

        let offer = self.resolver.resolve(&payload, &event, &self.scanner);

        if event.is_approval() {
            if offer.is_test_offer {
                tracing::info!(email = %email, "Test purchase, not provisioning a plan");
                return Ok(WebhookOutcome::ignored("test purchase"));
            }
            if offer.plan_tier.is_none() {
                tracing::info!(email = %email, "Approval without a resolvable commercial offer");
                return Ok(WebhookOutcome::ignored("no valid commercial offer found"));
            }
        }

        let transaction = self.scanner.find_transaction_id(&payload);
        let fallback = transaction.as_deref().or(offer.offer_id.as_deref());
        let key = IdempotencyKey::derive(&event, &email, fallback);

        match self.ledger.check_and_claim(&key, now).await {
            ClaimResult::Claimed => {}
            ClaimResult::Duplicate { outcome } => {
                tracing::info!(key = %key, "Duplicate delivery, acknowledging without effects");
                let message = match outcome {
                    Some(original) => format!("duplicate delivery: {}", original),
                    None => "duplicate delivery".to_string(),
                };
                return Ok(WebhookOutcome::duplicate(message));
            }
        }

        match self.apply_event(&email, &payload, &event, &offer, now).await {
            Ok(message) => {
                self.ledger.record_outcome(&key, &message).await;
                tracing::info!(email = %email, event = %event, outcome = %message, "Webhook processed");
                Ok(WebhookOutcome::processed(message))
            }
            Err(err) => {
                // No partial state was committed; drop the claim so the
                // provider's retry can reprocess.
                self.ledger.release(&key).await;
                tracing::error!(email = %email, event = %event, error = %err, "Webhook processing failed");
                Err(err)
            }
        }
    }

    /// Read-modify-write one user record under its per-customer lock.
    async fn apply_event(
        &self,
        email: &str,
        payload: &Value,
        event: &CanonicalEvent,
        offer: &ResolvedOffer,
        now: OffsetDateTime,
    ) -> ProcessingResult<String> {
        let _guard = self.locks.acquire(email).await;

        let existing = self.store.get_by_email(email).await?;

        let planned = match existing {
            Some(user) => self.plan_transition(&user, event, offer, now),
            None => {
                if event.is_approval() {
                    return self.create_customer(email, payload, offer, event, now).await;
                }
                PlannedTransition::NoOp {
                    message: "no user record for this customer, nothing to change".to_string(),
                }
            }
        };

        match planned {
            PlannedTransition::NoOp { message } => Ok(message),
            PlannedTransition::Commit(plan) => {
                let committed = self.store.update(plan.updated).await?;
                if let Some(notification) = plan.notification {
                    self.dispatch_notification(&committed.email, notification);
                }
                Ok(plan.message)
            }
        }
    }

    /// Compute the next state for an existing user. Pure: no I/O happens
    /// here, which is what makes the commit atomic.
    fn plan_transition(
        &self,
        user: &UserSubscriptionRecord,
        event: &CanonicalEvent,
        offer: &ResolvedOffer,
        now: OffsetDateTime,
    ) -> PlannedTransition {
        match event {
            CanonicalEvent::PurchaseApproved => {
                // Callers already filtered test offers and unresolvable
                // plans for approvals.
                let Some(tier) = offer.plan_tier else {
                    return PlannedTransition::NoOp {
                        message: "no valid commercial offer found".to_string(),
                    };
                };
                let regularized =
                    user.subscription_status == SubscriptionStatus::PendingCancellation;

                let mut updated = user.clone();
                updated.plan_tier = tier;
                updated.subscription_status = SubscriptionStatus::Active;
                updated.pending_downgrade = None;
                updated.previous_plan = None;
                if updated.subscription_start_date.is_none() {
                    updated.subscription_start_date = Some(now);
                }
                updated.subscription_end_date = Some(now + self.config.billing_cycle());
                updated.last_event = Some(LastEvent {
                    kind: event.clone(),
                    timestamp: now,
                });
                updated.updated_at = now;

                let message = if regularized {
                    format!(
                        "payment regularized, pending downgrade canceled, active on the {} plan",
                        tier
                    )
                } else {
                    format!("subscription activated on the {} plan", tier)
                };
                PlannedTransition::Commit(TransitionPlan {
                    updated,
                    message,
                    notification: None,
                })
            }

            CanonicalEvent::PurchaseRefunded | CanonicalEvent::PurchaseChargeback => {
                let decision = may_downgrade(user, event, now, &self.config);
                if !decision.allowed {
                    return PlannedTransition::NoOp {
                        message: format!("downgrade vetoed: {}", decision.reason),
                    };
                }

                let mut updated = user.clone();
                updated.previous_plan = Some(user.plan_tier);
                updated.plan_tier = PlanTier::Free;
                updated.subscription_status = SubscriptionStatus::PaymentFailed;
                updated.pending_downgrade = None;
                updated.last_event = Some(LastEvent {
                    kind: event.clone(),
                    timestamp: now,
                });
                updated.updated_at = now;

                PlannedTransition::Commit(TransitionPlan {
                    updated,
                    message: format!("plan revoked immediately after {}", event.as_str()),
                    notification: Some(Notification::PaymentFailed),
                })
            }

            CanonicalEvent::PurchaseCanceled | CanonicalEvent::SubscriptionCanceled => {
                let decision = may_downgrade(user, event, now, &self.config);
                if !decision.allowed {
                    return PlannedTransition::NoOp {
                        message: format!("downgrade vetoed: {}", decision.reason),
                    };
                }
                if user.subscription_status == SubscriptionStatus::PendingCancellation {
                    return PlannedTransition::NoOp {
                        message: "downgrade already scheduled".to_string(),
                    };
                }

                let scheduled_for = now + self.config.tolerance_window();
                let mut updated = user.clone();
                updated.subscription_status = SubscriptionStatus::PendingCancellation;
                updated.pending_downgrade = Some(PendingDowngrade {
                    scheduled_for,
                    reason: format!("{} event received", event.as_str()),
                    original_plan: user.plan_tier,
                });
                updated.last_event = Some(LastEvent {
                    kind: event.clone(),
                    timestamp: now,
                });
                updated.updated_at = now;

                PlannedTransition::Commit(TransitionPlan {
                    updated,
                    message: format!("downgrade scheduled for {}", scheduled_for),
                    notification: Some(Notification::CancellationScheduled { scheduled_for }),
                })
            }

            CanonicalEvent::Unsupported(raw) => PlannedTransition::NoOp {
                message: format!("unsupported event type '{}'", raw),
            },
        }
    }

    /// New-customer path: an approval for an unknown email materializes a
    /// record that is already active on the resolved plan, with a
    /// system-generated temporary credential.
    async fn create_customer(
        &self,
        email: &str,
        payload: &Value,
        offer: &ResolvedOffer,
        event: &CanonicalEvent,
        now: OffsetDateTime,
    ) -> ProcessingResult<String> {
        let Some(tier) = offer.plan_tier else {
            return Ok("no valid commercial offer found".to_string());
        };

        let name = self.scanner.find_customer_name(payload);
        let phone = self.scanner.find_phone(payload);
        let temporary_credential = generate_temporary_credential();

        let mut record = UserSubscriptionRecord::new_free(email, name.clone(), phone, now);
        record.plan_tier = tier;
        record.subscription_status = SubscriptionStatus::Active;
        record.subscription_start_date = Some(now);
        record.subscription_end_date = Some(now + self.config.billing_cycle());
        record.last_event = Some(LastEvent {
            kind: event.clone(),
            timestamp: now,
        });

        let created = self.store.create(record).await?;
        tracing::info!(
            user_id = %created.id,
            email = %created.email,
            tier = %tier,
            "Created user record from approval webhook"
        );

        self.dispatch_notification(
            &created.email,
            Notification::Welcome {
                name,
                temporary_credential,
            },
        );

        Ok(format!(
            "new customer registered and activated on the {} plan",
            tier
        ))
    }

    /// Apply the Free transition to every user whose tolerance window has
    /// elapsed. Invoked by the worker on a schedule; the only mutation
    /// path not triggered by an inbound event.
    pub async fn run_downgrade_sweep(&self) -> ProcessingResult<SweepStats> {
        self.run_downgrade_sweep_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_downgrade_sweep_at(&self, now: OffsetDateTime) -> ProcessingResult<SweepStats> {
        let users = self.store.list_users().await?;
        let mut stats = SweepStats::default();

        for user in users {
            let due = user.subscription_status == SubscriptionStatus::PendingCancellation
                && user
                    .pending_downgrade
                    .as_ref()
                    .is_some_and(|pending| pending.scheduled_for <= now);
            if !due {
                continue;
            }
            stats.examined += 1;

            let _guard = self.locks.acquire(&user.email).await;

            // Re-read under the lock; an approval may have raced the sweep.
            let current = match self.store.get_by_id(user.id).await {
                Ok(Some(current)) => current,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(user_id = %user.id, error = %err, "Sweep failed to re-read user");
                    stats.failed += 1;
                    continue;
                }
            };
            let Some(pending) = current.pending_downgrade.clone() else {
                continue;
            };
            if current.subscription_status != SubscriptionStatus::PendingCancellation
                || pending.scheduled_for > now
            {
                continue;
            }

            let mut updated = current.clone();
            updated.previous_plan = Some(pending.original_plan);
            updated.plan_tier = PlanTier::Free;
            updated.subscription_status = SubscriptionStatus::Inactive;
            updated.pending_downgrade = None;
            updated.updated_at = now;

            match self.store.update(updated).await {
                Ok(committed) => {
                    stats.downgraded += 1;
                    tracing::warn!(
                        user_id = %committed.id,
                        email = %committed.email,
                        original_plan = %pending.original_plan,
                        reason = %pending.reason,
                        "Tolerance window elapsed, user downgraded to free tier"
                    );
                    let notifier = Arc::clone(&self.notifier);
                    let email = committed.email.clone();
                    let previous = pending.original_plan;
                    tokio::spawn(async move {
                        if let Err(err) = notifier.send_downgraded(&email, previous).await {
                            tracing::error!(error = %err, "Failed to send downgrade notification");
                        }
                    });
                }
                Err(err) => {
                    stats.failed += 1;
                    tracing::error!(user_id = %user.id, error = %err, "Sweep failed to commit downgrade");
                }
            }
        }

        tracing::info!(
            examined = stats.examined,
            downgraded = stats.downgraded,
            failed = stats.failed,
            "Downgrade sweep complete"
        );
        Ok(stats)
    }

    /// Fire-and-forget notification dispatch. Delivery failures are
    /// logged; they never fail the webhook acknowledgment.
    fn dispatch_notification(&self, email: &str, notification: Notification) {
        let notifier = Arc::clone(&self.notifier);
        let email = email.to_string();
        tokio::spawn(async move {
            let result = match notification {
                Notification::Welcome {
                    name,
                    temporary_credential,
                } => {
                    notifier
                        .send_welcome(&email, name.as_deref(), &temporary_credential)
                        .await
                }
                Notification::CancellationScheduled { scheduled_for } => {
                    notifier
                        .send_cancellation_scheduled(&email, scheduled_for)
                        .await
                }
                Notification::PaymentFailed => notifier.send_payment_failed(&email).await,
            };
            if let Err(err) = result {
                tracing::error!(email = %email, error = %err, "Notification dispatch failed");
            }
        });
    }
}

/// HMAC-SHA256 over the raw body, hex-encoded. Accepts the digest bare or
/// with a `sha256=` prefix; comparison is case-insensitive on the hex.
fn verify_signature(payload: &str, signature: &str, secret: &str) -> bool {
    let provided = signature.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => {
            tracing::error!("Invalid webhook secret key");
            return false;
        }
    };
    mac.update(payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    computed.eq_ignore_ascii_case(provided)
}

fn generate_temporary_credential() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TEMPORARY_CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}
