// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Subscription Engine
//!
//! Cross-component scenarios and race conditions:
//! - End-to-end webhook round trips
//! - Duplicate and concurrent delivery (idempotency)
//! - Downgrade guard interplay with the state machine
//! - Tolerance-window scheduling and expiry sweep
//! - Test-offer rejection
//! - Signature strictness
//! - Claim release after persistence failures

#[cfg(test)]
mod engine_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use serde_json::json;
    use time::{Duration, OffsetDateTime};

    use crate::config::EngineConfig;
    use crate::engine::{OutcomeKind, SubscriptionEngine};
    use crate::events::CanonicalEvent;
    use crate::offers::{OfferCatalog, PlanTier};
    use crate::store::{
        InMemoryUserStore, LastEvent, LoggingNotifier, StoreError, SubscriptionStatus, UserStore,
        UserSubscriptionRecord,
    };

    fn engine_with_store() -> (SubscriptionEngine, Arc<InMemoryUserStore>) {
        let store = Arc::new(InMemoryUserStore::new());
        let engine = SubscriptionEngine::new(
            EngineConfig::default(),
            OfferCatalog::default(),
            store.clone(),
            Arc::new(LoggingNotifier),
        );
        (engine, store)
    }

    fn approval_payload(email: &str) -> String {
        json!({
            "event": "PURCHASE_APPROVED",
            "transaction": "txn-7781",
            "data": {
                "buyer": { "email": email, "name": "Ana Fotografia" },
                "purchase": { "offer": { "off": "tpfhcllk" } }
            }
        })
        .to_string()
    }

    async fn seed_active_standard(
        store: &InMemoryUserStore,
        email: &str,
        now: OffsetDateTime,
    ) -> UserSubscriptionRecord {
        let mut user = UserSubscriptionRecord::new_free(email, None, None, now);
        user.plan_tier = PlanTier::Standard;
        user.subscription_status = SubscriptionStatus::Active;
        user.subscription_start_date = Some(now - Duration::days(40));
        user.subscription_end_date = Some(now + Duration::days(20));
        user.last_event = Some(LastEvent {
            kind: CanonicalEvent::PurchaseApproved,
            timestamp: now - Duration::days(10),
        });
        store.create(user.clone()).await.unwrap()
    }

    // =========================================================================
    // Round trip: approval for an unknown email creates an active user
    // =========================================================================
    #[tokio::test]
    async fn approval_round_trip_creates_active_user() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();

        let outcome = engine
            .process_webhook_at(&approval_payload("a@b.com"), None, now)
            .await
            .unwrap();
        assert!(outcome.accepted, "{}", outcome.message);

        let user = store.get_by_email("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.plan_tier, PlanTier::Standard);
        assert_eq!(user.subscription_status, SubscriptionStatus::Active);
        assert_eq!(user.subscription_start_date, Some(now));
        assert!(user.subscription_end_date.unwrap() > now);
        assert_eq!(user.name.as_deref(), Some("Ana Fotografia"));
    }

    // =========================================================================
    // Sequential duplicate delivery: one transition, both acknowledged
    // =========================================================================
    #[tokio::test]
    async fn duplicate_delivery_is_acknowledged_without_second_transition() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();
        let body = approval_payload("dup@b.com");

        let first = engine.process_webhook_at(&body, None, now).await.unwrap();
        let snapshot = store.get_by_email("dup@b.com").await.unwrap().unwrap();

        let second = engine
            .process_webhook_at(&body, None, now + Duration::minutes(5))
            .await
            .unwrap();
        assert!(first.accepted && second.accepted);
        assert_eq!(second.kind, OutcomeKind::Duplicate);

        let after = store.get_by_email("dup@b.com").await.unwrap().unwrap();
        assert_eq!(after, snapshot, "second delivery must not mutate the record");
    }

    // =========================================================================
    // Concurrent duplicate delivery: exactly one transition
    // =========================================================================
    #[tokio::test]
    async fn concurrent_deliveries_produce_one_transition() {
        use tokio::sync::Barrier;

        let (engine, store) = engine_with_store();
        let engine = Arc::new(engine);
        let now = OffsetDateTime::now_utc();
        let body = approval_payload("race@b.com");

        let barrier = Arc::new(Barrier::new(6));
        let mut handles = vec![];
        for _ in 0..6 {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let body = body.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.process_webhook_at(&body, None, now).await.unwrap()
            }));
        }

        let mut duplicates = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.accepted, "losers must still be acknowledged");
            if outcome.message.contains("duplicate") {
                duplicates += 1;
            }
        }
        assert_eq!(duplicates, 5, "exactly one delivery may apply the transition");

        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].plan_tier, PlanTier::Standard);
    }

    // =========================================================================
    // Guard: fresh manual activation survives cancellation, not refund
    // =========================================================================
    #[tokio::test]
    async fn manual_activation_blocks_cancellation_but_not_refund() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();

        let mut user = seed_active_standard(&store, "manual@b.com", now).await;
        user.is_manual_activation = true;
        user.manual_activation_date = Some(now - Duration::days(10));
        user.last_event = None;
        store.update(user).await.unwrap();

        let cancel = json!({
            "event": "PURCHASE_CANCELED",
            "email": "manual@b.com",
            "transaction": "txn-c1"
        })
        .to_string();
        let outcome = engine.process_webhook_at(&cancel, None, now).await.unwrap();
        assert!(outcome.accepted);
        assert!(outcome.message.contains("vetoed"), "{}", outcome.message);

        let unchanged = store.get_by_email("manual@b.com").await.unwrap().unwrap();
        assert_eq!(unchanged.subscription_status, SubscriptionStatus::Active);
        assert_eq!(unchanged.plan_tier, PlanTier::Standard);

        let refund = json!({
            "event": "PURCHASE_REFUNDED",
            "email": "manual@b.com",
            "transaction": "txn-r1"
        })
        .to_string();
        engine.process_webhook_at(&refund, None, now).await.unwrap();

        let downgraded = store.get_by_email("manual@b.com").await.unwrap().unwrap();
        assert_eq!(downgraded.plan_tier, PlanTier::Free);
        assert_eq!(
            downgraded.subscription_status,
            SubscriptionStatus::PaymentFailed
        );
        assert_eq!(downgraded.previous_plan, Some(PlanTier::Standard));
    }

    // =========================================================================
    // Cancellation schedules the downgrade at now + tolerance window
    // =========================================================================
    #[tokio::test]
    async fn cancellation_schedules_downgrade_three_days_out() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();
        seed_active_standard(&store, "cancel@b.com", now).await;

        let body = json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "email": "cancel@b.com",
            "transaction": "txn-s1"
        })
        .to_string();
        let outcome = engine.process_webhook_at(&body, None, now).await.unwrap();
        assert!(outcome.accepted, "{}", outcome.message);

        let user = store.get_by_email("cancel@b.com").await.unwrap().unwrap();
        assert_eq!(
            user.subscription_status,
            SubscriptionStatus::PendingCancellation
        );
        let pending = user.pending_downgrade.unwrap();
        assert_eq!(pending.scheduled_for, now + Duration::days(3));
        assert_eq!(pending.original_plan, PlanTier::Standard);
    }

    // =========================================================================
    // Sweep: downgrade exactly when the schedule elapses, never before
    // =========================================================================
    #[tokio::test]
    async fn sweep_downgrades_only_after_scheduled_time() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();
        seed_active_standard(&store, "sweep@b.com", now).await;

        let body = json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "email": "sweep@b.com",
            "transaction": "txn-s2"
        })
        .to_string();
        engine.process_webhook_at(&body, None, now).await.unwrap();
        let scheduled_for = now + Duration::days(3);

        // One minute early: nothing happens.
        let early = engine
            .run_downgrade_sweep_at(scheduled_for - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(early.downgraded, 0);
        let untouched = store.get_by_email("sweep@b.com").await.unwrap().unwrap();
        assert_eq!(untouched.plan_tier, PlanTier::Standard);

        // One minute late: the free transition applies.
        let late = engine
            .run_downgrade_sweep_at(scheduled_for + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(late.downgraded, 1);

        let downgraded = store.get_by_email("sweep@b.com").await.unwrap().unwrap();
        assert_eq!(downgraded.plan_tier, PlanTier::Free);
        assert_eq!(downgraded.subscription_status, SubscriptionStatus::Inactive);
        assert_eq!(downgraded.pending_downgrade, None);
        assert_eq!(downgraded.previous_plan, Some(PlanTier::Standard));
    }

    // =========================================================================
    // Approval during the tolerance window cancels the pending downgrade
    // =========================================================================
    #[tokio::test]
    async fn approval_regularizes_pending_cancellation() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();
        seed_active_standard(&store, "regular@b.com", now).await;

        let cancel = json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "email": "regular@b.com",
            "transaction": "txn-s3"
        })
        .to_string();
        engine.process_webhook_at(&cancel, None, now).await.unwrap();

        let approval = approval_payload("regular@b.com");
        let outcome = engine
            .process_webhook_at(&approval, None, now + Duration::days(1))
            .await
            .unwrap();
        assert!(outcome.accepted);

        let user = store.get_by_email("regular@b.com").await.unwrap().unwrap();
        assert_eq!(user.subscription_status, SubscriptionStatus::Active);
        assert_eq!(user.pending_downgrade, None);

        // The sweep afterwards has nothing left to do.
        let stats = engine
            .run_downgrade_sweep_at(now + Duration::days(4))
            .await
            .unwrap();
        assert_eq!(stats.downgraded, 0);
    }

    // =========================================================================
    // Test offers never provision a plan, even with a real offer id present
    // =========================================================================
    #[tokio::test]
    async fn test_offer_never_provisions_a_plan() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();

        let body = json!({
            "event": "PURCHASE_APPROVED",
            "email": "tester@b.com",
            "offer_name": "Oferta de Teste",
            "purchase": { "checkout_url": "https://pay.example.com/buy?off=tpfhcllk" }
        })
        .to_string();
        let outcome = engine.process_webhook_at(&body, None, now).await.unwrap();
        assert!(outcome.accepted);
        assert!(outcome.message.contains("test"), "{}", outcome.message);

        assert!(store.get_by_email("tester@b.com").await.unwrap().is_none());
    }

    // =========================================================================
    // Rejected/ignored deliveries never consume ledger capacity
    // =========================================================================
    #[tokio::test]
    async fn ignored_events_do_not_touch_the_ledger() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();

        // Unsupported event type.
        let unsupported = json!({ "event": "PURCHASE_DELAYED", "email": "x@y.com" }).to_string();
        let outcome = engine
            .process_webhook_at(&unsupported, None, now)
            .await
            .unwrap();
        assert!(outcome.accepted);

        // No extractable identity.
        let anonymous = json!({ "event": "PURCHASE_APPROVED", "off": "tpfhcllk" }).to_string();
        let outcome = engine
            .process_webhook_at(&anonymous, None, now)
            .await
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.kind, OutcomeKind::IdentityNotFound);

        // Approval with no resolvable offer.
        let no_offer = json!({ "event": "PURCHASE_APPROVED", "email": "x@y.com" }).to_string();
        let outcome = engine.process_webhook_at(&no_offer, None, now).await.unwrap();
        assert!(outcome.accepted);

        assert_eq!(engine.ledger().len().await, 0);
        assert!(store.list_users().await.unwrap().is_empty());
    }

    // =========================================================================
    // Cancellation for an unknown customer is a harmless no-op
    // =========================================================================
    #[tokio::test]
    async fn cancellation_for_unknown_customer_is_noop() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();

        let body = json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "email": "stranger@b.com",
            "transaction": "txn-u1"
        })
        .to_string();
        let outcome = engine.process_webhook_at(&body, None, now).await.unwrap();
        assert!(outcome.accepted);
        assert!(store.list_users().await.unwrap().is_empty());
    }

    // =========================================================================
    // Malformed payloads are rejected without retry semantics
    // =========================================================================
    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let (engine, _store) = engine_with_store();
        let now = OffsetDateTime::now_utc();

        let outcome = engine
            .process_webhook_at("this is not json", None, now)
            .await
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.kind, OutcomeKind::MalformedPayload);

        let outcome = engine.process_webhook_at("[1,2,3]", None, now).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.kind, OutcomeKind::MalformedPayload);
    }

    // =========================================================================
    // Signature strictness
    // =========================================================================
    #[tokio::test]
    async fn strict_mode_requires_a_valid_signature() {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let store = Arc::new(InMemoryUserStore::new());
        let config = EngineConfig {
            webhook_secret: Some("whsec_demo".to_string()),
            strict_signatures: true,
            ..EngineConfig::default()
        };
        let engine = SubscriptionEngine::new(
            config,
            OfferCatalog::default(),
            store.clone(),
            Arc::new(LoggingNotifier),
        );
        let now = OffsetDateTime::now_utc();
        let body = approval_payload("signed@b.com");

        // Unsigned: refused in strict mode.
        let outcome = engine.process_webhook_at(&body, None, now).await.unwrap();
        assert!(!outcome.accepted);

        // Tampered signature: refused.
        let outcome = engine
            .process_webhook_at(&body, Some("deadbeef"), now)
            .await
            .unwrap();
        assert!(!outcome.accepted);

        // Properly signed: processed.
        let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec_demo").unwrap();
        mac.update(body.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        let outcome = engine
            .process_webhook_at(&body, Some(&signature), now)
            .await
            .unwrap();
        assert!(outcome.accepted, "{}", outcome.message);
        assert!(store.get_by_email("signed@b.com").await.unwrap().is_some());
    }

    // =========================================================================
    // A persistence failure releases the claim so the retry can land
    // =========================================================================
    struct FlakyStore {
        inner: InMemoryUserStore,
        fail_updates: AtomicBool,
    }

    #[async_trait::async_trait]
    impl UserStore for FlakyStore {
        async fn get_by_email(
            &self,
            email: &str,
        ) -> Result<Option<UserSubscriptionRecord>, StoreError> {
            self.inner.get_by_email(email).await
        }

        async fn get_by_id(
            &self,
            id: uuid::Uuid,
        ) -> Result<Option<UserSubscriptionRecord>, StoreError> {
            self.inner.get_by_id(id).await
        }

        async fn create(
            &self,
            record: UserSubscriptionRecord,
        ) -> Result<UserSubscriptionRecord, StoreError> {
            self.inner.create(record).await
        }

        async fn update(
            &self,
            record: UserSubscriptionRecord,
        ) -> Result<UserSubscriptionRecord, StoreError> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("simulated outage".to_string()));
            }
            self.inner.update(record).await
        }

        async fn list_users(&self) -> Result<Vec<UserSubscriptionRecord>, StoreError> {
            self.inner.list_users().await
        }
    }

    #[tokio::test]
    async fn persistence_failure_is_retryable() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryUserStore::new(),
            fail_updates: AtomicBool::new(true),
        });
        let engine = SubscriptionEngine::new(
            EngineConfig::default(),
            OfferCatalog::default(),
            store.clone(),
            Arc::new(LoggingNotifier),
        );
        let now = OffsetDateTime::now_utc();
        seed_active_standard(&store.inner, "flaky@b.com", now).await;

        let body = json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "email": "flaky@b.com",
            "transaction": "txn-f1"
        })
        .to_string();

        // First delivery hits the outage and surfaces a retryable error.
        let result = engine.process_webhook_at(&body, None, now).await;
        assert!(result.is_err());
        assert_eq!(engine.ledger().len().await, 0, "failed claim must be released");

        // Provider retry after the outage succeeds and is not treated as
        // a duplicate of the failed attempt.
        store.fail_updates.store(false, Ordering::SeqCst);
        let outcome = engine
            .process_webhook_at(&body, None, now + Duration::minutes(2))
            .await
            .unwrap();
        assert!(outcome.accepted);

        let user = store.inner.get_by_email("flaky@b.com").await.unwrap().unwrap();
        assert_eq!(
            user.subscription_status,
            SubscriptionStatus::PendingCancellation
        );
    }

    // =========================================================================
    // Out-of-order cancellation racing a fresh approval is vetoed
    // =========================================================================
    #[tokio::test]
    async fn cancellation_racing_fresh_approval_is_vetoed() {
        let (engine, store) = engine_with_store();
        let now = OffsetDateTime::now_utc();

        engine
            .process_webhook_at(&approval_payload("racer@b.com"), None, now)
            .await
            .unwrap();

        // The cancellation arrives two hours later, inside the race window.
        let cancel = json!({
            "event": "SUBSCRIPTION_CANCELLATION",
            "email": "racer@b.com",
            "transaction": "txn-r2"
        })
        .to_string();
        let outcome = engine
            .process_webhook_at(&cancel, None, now + Duration::hours(2))
            .await
            .unwrap();
        assert!(outcome.accepted);
        assert!(outcome.message.contains("vetoed"), "{}", outcome.message);

        let user = store.get_by_email("racer@b.com").await.unwrap().unwrap();
        assert_eq!(user.subscription_status, SubscriptionStatus::Active);
        assert_eq!(user.plan_tier, PlanTier::Standard);
    }
}
