//! Error types for the subscription event processing engine.
//!
//! Most irregular inputs are not errors at all: unsupported events,
//! unresolvable offers, duplicate deliveries, malformed bodies and
//! missing identities all degrade to a [`crate::engine::WebhookOutcome`]
//! whose kind carries the classification, so the provider gets a
//! definitive acknowledgment and stops retrying. Only the failures below
//! escape the pipeline, and the transport layer should map them to a
//! retryable (5xx-class) response: nothing partial was committed, so the
//! provider's redelivery can succeed.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The user store failed mid-transition.
    #[error("user store failure: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ProcessingError {
    fn from(err: StoreError) -> Self {
        ProcessingError::Persistence(err.to_string())
    }
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;
