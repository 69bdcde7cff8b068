// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Lumiproof Billing Module
//!
//! Subscription event processing for the Lumiproof proofing platform:
//! ingests payment-provider webhooks of unstable shape, normalizes them
//! into canonical events, and drives each photographer's subscription
//! state with exactly-once side effects.
//!
//! ## Features
//!
//! - **Payload Scanning**: locate identity and offer data anywhere in an
//!   arbitrarily nested payload
//! - **Event Normalization**: declarative alias table over a closed set of
//!   canonical events
//! - **Offer Resolution**: offer id and plan-name heuristics, test-offer
//!   rejection
//! - **Idempotency**: bounded, time-windowed duplicate detection safe
//!   under concurrent delivery
//! - **Downgrade Safety**: policy guard against webhook races clobbering
//!   paying customers
//! - **State Machine**: approval / refund / chargeback / cancellation
//!   transitions with a tolerance window before any downgrade
//! - **Status Analysis**: pure subscription health reports for operators

pub mod admin;
pub mod analyzer;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod idempotency;
pub mod offers;
pub mod payload;
pub mod store;

#[cfg(test)]
mod edge_case_tests;

// Admin
pub use admin::{list_users_by_category, CategorizedUser, UserCategory};

// Analyzer
pub use analyzer::{analyze, SubscriptionAnalysis};

// Config
pub use config::EngineConfig;

// Engine
pub use engine::{OutcomeKind, SubscriptionEngine, SweepStats, WebhookOutcome};

// Error
pub use error::{ProcessingError, ProcessingResult};

// Events
pub use events::{normalize, CanonicalEvent};

// Guard
pub use guard::{may_downgrade, GuardDecision};

// Idempotency
pub use idempotency::{ClaimResult, IdempotencyKey, IdempotencyLedger};

// Offers
pub use offers::{OfferCatalog, OfferResolver, PlanTier, ResolvedOffer};

// Payload
pub use payload::PayloadScanner;

// Store
pub use store::{
    InMemoryUserStore, LastEvent, LoggingNotifier, Notifier, NotifyError, PendingDowngrade,
    StoreError, SubscriptionStatus, UserStore, UserSubscriptionRecord,
};
