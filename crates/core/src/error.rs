//! Error taxonomy
//!
//! Every failure the engine can see is classified, and the class decides
//! the handling: validation errors are rejected before any
//! write and never retried; transient errors are retried with backoff and,
//! for deferrable side effects, queued; permanent errors are logged and
//! dropped; storage errors surface to the caller, who retries the whole
//! operation (safe under the idempotency guard). Duplicates are not errors;
//! they are an `Ok` outcome of ingestion.

use std::time::Duration;

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input, rejected before any write.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Network-level or provider-side failure expected to clear on its own.
    /// `retry_after` carries the provider's own slow-down request, honored
    /// exactly instead of computed backoff.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Failure that will not change on retry (bad request, missing join
    /// request, forbidden chat).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The ledger store could not complete the operation. Nothing was
    /// partially applied; the caller retries the whole unit.
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// Fail-fast rejection while a breaker is open. Not retried in place;
    /// deferrable effects go to the operation queue instead.
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// Bounded call deadline exceeded. Accounted as transient.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        CoreError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Provider asked us to slow down; the retry layer sleeps exactly this
    /// long instead of its own backoff.
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        CoreError::Transient {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    /// Whether the retry layer may attempt this call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient { .. } | CoreError::Timeout(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
