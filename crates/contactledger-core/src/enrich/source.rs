//! The enrichment source capability.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{EnrichmentFields, ReasonCode};
use crate::retry::{RetryClass, Retryable};

/// Why a lookup produced no data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// Source has nothing on this identity.
    #[error("not found")]
    NotFound,

    /// Source refused the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Source throttled the call.
    #[error("rate limited")]
    RateLimited {
        /// Wait requested by the source.
        retry_after: Option<Duration>,
    },

    /// Network failure or 5xx answer.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Run was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl LookupError {
    /// Reason code recorded on the contact.
    #[must_use]
    pub const fn reason_code(&self) -> ReasonCode {
        match self {
            Self::NotFound => ReasonCode::NotFound,
            Self::Unauthorized(_) => ReasonCode::Unauthorized,
            Self::RateLimited { .. } => ReasonCode::RateLimited,
            Self::Transient(_) => ReasonCode::TransientExhausted,
            Self::Timeout(_) => ReasonCode::Timeout,
            Self::Cancelled => ReasonCode::Cancelled,
        }
    }
}

impl Retryable for LookupError {
    fn retry_class(&self) -> RetryClass {
        match self {
            Self::Transient(_) | Self::Timeout(_) => RetryClass::Transient,
            Self::RateLimited { retry_after } => RetryClass::RateLimited(*retry_after),
            Self::NotFound | Self::Unauthorized(_) | Self::Cancelled => RetryClass::Permanent,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transient(error.to_string())
    }
}

/// An external (or local) service that adds attributes to an identity.
///
/// Implementations perform a single call; retries, rate limiting, caching
/// and deadlines are applied by the scheduler.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    /// Unique source name, used in cache keys and summaries.
    fn name(&self) -> &str;

    /// Confidence of this source's data in `[0, 1]`.
    fn confidence(&self) -> f32 {
        0.5
    }

    /// Looks up `email` (canonical form) with its domain.
    async fn lookup(&self, email: &str, domain: Option<&str>)
    -> Result<EnrichmentFields, LookupError>;
}
