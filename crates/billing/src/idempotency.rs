//! Idempotency ledger.
//!
//! Payment providers deliver at least once; this ledger is what turns
//! that into at-most-once side effects. A processed
//! `(event, customer, transaction)` triple is remembered for a retention
//! window; re-deliveries inside the window short-circuit with the original
//! outcome.
//!
//! The claim is a single check-and-set under one write lock. Two
//! concurrent deliveries of the same event race for the claim; exactly one
//! wins and applies the transition, the loser observes a duplicate and
//! acknowledges without side effects. Staleness is checked on read;
//! eviction is lazy on write (expired entries first, then oldest by first
//! sighting when the capacity bound is exceeded).

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::events::CanonicalEvent;

/// Deterministic key for one logical webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key from the canonical event, the customer email, and
    /// the transaction id (or a caller-chosen fallback when the payload
    /// carries none).
    pub fn derive(event: &CanonicalEvent, customer_email: &str, transaction: Option<&str>) -> Self {
        let transaction = transaction.unwrap_or("none");
        Self(format!(
            "{}:{}:{}",
            event.as_str(),
            customer_email.trim().to_lowercase(),
            transaction.trim().to_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    first_seen_at: OffsetDateTime,
    /// Set once processing finishes; a claimed-but-unfinished entry holds
    /// `None`.
    outcome: Option<String>,
}

/// Result of attempting to claim a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// First sighting inside the retention window; caller owns processing.
    Claimed,
    /// Already processed (or processing); carries the recorded outcome.
    Duplicate { outcome: Option<String> },
}

/// Bounded, time-windowed record of processed deliveries.
pub struct IdempotencyLedger {
    entries: RwLock<HashMap<String, LedgerEntry>>,
    retention: Duration,
    capacity: usize,
}

impl IdempotencyLedger {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
            capacity,
        }
    }

    /// Atomically claim a key for processing.
    ///
    /// The check and the insert happen under the same write lock, so of N
    /// concurrent calls for one key exactly one returns [`ClaimResult::Claimed`].
    pub async fn check_and_claim(&self, key: &IdempotencyKey, now: OffsetDateTime) -> ClaimResult {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(key.as_str()) {
            if now - existing.first_seen_at <= self.retention {
                tracing::debug!(key = %key, "Duplicate delivery detected by idempotency ledger");
                return ClaimResult::Duplicate {
                    outcome: existing.outcome.clone(),
                };
            }
            // Past the retention window: treated as never seen.
            entries.remove(key.as_str());
        }

        if entries.len() >= self.capacity {
            Self::evict(&mut entries, self.retention, self.capacity, now);
        }

        entries.insert(
            key.as_str().to_string(),
            LedgerEntry {
                first_seen_at: now,
                outcome: None,
            },
        );
        ClaimResult::Claimed
    }

    /// Record the outcome of a completed processing attempt.
    pub async fn record_outcome(&self, key: &IdempotencyKey, outcome: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key.as_str()) {
            entry.outcome = Some(outcome.to_string());
        } else {
            tracing::warn!(key = %key, "Recorded outcome for a key the ledger no longer holds");
        }
    }

    /// Drop a claim after a failed processing attempt, so the provider's
    /// retry is not short-circuited as a duplicate.
    pub async fn release(&self, key: &IdempotencyKey) {
        let mut entries = self.entries.write().await;
        entries.remove(key.as_str());
    }

    /// Remove every entry past the retention window. Returns how many
    /// were dropped. Scheduled periodically by the worker.
    pub async fn cleanup(&self, now: OffsetDateTime) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let retention = self.retention;
        entries.retain(|_, entry| now - entry.first_seen_at <= retention);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(
                removed,
                remaining = entries.len(),
                "Cleaned up expired idempotency entries"
            );
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Expired entries go first; if that is not enough, the oldest tenth
    /// of the ledger is dropped by first-seen timestamp.
    fn evict(
        entries: &mut HashMap<String, LedgerEntry>,
        retention: Duration,
        capacity: usize,
        now: OffsetDateTime,
    ) {
        entries.retain(|_, entry| now - entry.first_seen_at <= retention);

        if entries.len() >= capacity {
            let drop_count = (capacity / 10).max(1);
            let mut by_age: Vec<(String, OffsetDateTime)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.first_seen_at))
                .collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            for (key, _) in by_age.into_iter().take(drop_count) {
                entries.remove(&key);
            }
        }

        tracing::info!(
            remaining = entries.len(),
            capacity,
            "Evicted idempotency entries to stay within capacity"
        );
    }
}
