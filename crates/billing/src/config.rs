//! Engine configuration.
//!
//! Every policy constant the engine applies lives here rather than being
//! hard-coded at its point of use: the downgrade tolerance window, the
//! manual-activation grace period, the approval race guard, idempotency
//! retention and capacity, the payload scan depth bound, and signature
//! strictness. Defaults match observed production values.

use time::Duration;

/// Runtime configuration for the subscription engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Days between a cancellation-class event and the actual downgrade
    /// to the free tier.
    pub tolerance_window_days: i64,
    /// Days during which a support-granted (manual) activation is
    /// protected from automatic downgrade.
    pub manual_activation_grace_days: i64,
    /// Hours after a successful purchase during which cancellation-class
    /// events are assumed to be webhook races and vetoed.
    pub approval_race_guard_hours: i64,
    /// How long a processed-event record shields against duplicates.
    pub idempotency_retention_hours: i64,
    /// Maximum number of idempotency records held in memory.
    pub idempotency_capacity: usize,
    /// Maximum recursion depth when scanning payloads.
    pub scan_depth_limit: usize,
    /// Length of one billing cycle; approvals roll the subscription end
    /// date forward by this much.
    pub billing_cycle_days: i64,
    /// Shared secret for HMAC-SHA256 webhook signatures. `None` disables
    /// verification entirely.
    pub webhook_secret: Option<String>,
    /// When true and a secret is configured, unsigned deliveries are
    /// refused instead of logged.
    pub strict_signatures: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tolerance_window_days: 3,
            manual_activation_grace_days: 30,
            approval_race_guard_hours: 24,
            idempotency_retention_hours: 24,
            idempotency_capacity: 10_000,
            scan_depth_limit: 15,
            billing_cycle_days: 30,
            webhook_secret: None,
            strict_signatures: false,
        }
    }
}

impl EngineConfig {
    /// Build a config from environment variables, falling back to the
    /// defaults above for anything unset or unparseable.
    ///
    /// Binaries are expected to have loaded `.env` (dotenvy) beforehand.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tolerance_window_days: env_i64(
                "LUMIPROOF_TOLERANCE_WINDOW_DAYS",
                defaults.tolerance_window_days,
            ),
            manual_activation_grace_days: env_i64(
                "LUMIPROOF_MANUAL_ACTIVATION_GRACE_DAYS",
                defaults.manual_activation_grace_days,
            ),
            approval_race_guard_hours: env_i64(
                "LUMIPROOF_APPROVAL_RACE_GUARD_HOURS",
                defaults.approval_race_guard_hours,
            ),
            idempotency_retention_hours: env_i64(
                "LUMIPROOF_IDEMPOTENCY_RETENTION_HOURS",
                defaults.idempotency_retention_hours,
            ),
            idempotency_capacity: env_usize(
                "LUMIPROOF_IDEMPOTENCY_CAPACITY",
                defaults.idempotency_capacity,
            ),
            scan_depth_limit: env_usize("LUMIPROOF_SCAN_DEPTH_LIMIT", defaults.scan_depth_limit),
            billing_cycle_days: env_i64("LUMIPROOF_BILLING_CYCLE_DAYS", defaults.billing_cycle_days),
            webhook_secret: std::env::var("LUMIPROOF_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            strict_signatures: std::env::var("LUMIPROOF_STRICT_SIGNATURES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.strict_signatures),
        }
    }

    pub fn tolerance_window(&self) -> Duration {
        Duration::days(self.tolerance_window_days)
    }

    pub fn manual_activation_grace(&self) -> Duration {
        Duration::days(self.manual_activation_grace_days)
    }

    pub fn approval_race_guard(&self) -> Duration {
        Duration::hours(self.approval_race_guard_hours)
    }

    pub fn idempotency_retention(&self) -> Duration {
        Duration::hours(self.idempotency_retention_hours)
    }

    pub fn billing_cycle(&self) -> Duration {
        Duration::days(self.billing_cycle_days)
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
