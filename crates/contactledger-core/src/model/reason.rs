//! Machine-readable reasons attached to every drop, skip and failure.

use serde::{Deserialize, Serialize};

/// Why something was dropped, skipped or failed.
///
/// Serialized in `snake_case` so summaries stay stable for downstream tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Address failed syntax validation and carried no usable name.
    InvalidAddress,
    /// Header entry had neither an address nor a display name.
    NoAddress,
    /// Address belongs to the account being extracted.
    SelfAddress,
    /// Address matched an ignore rule (no-reply, bounces, ...).
    Ignored,
    /// Address is the mailing list the message was distributed through.
    MailingList,
    /// Same address already observed in this message.
    Duplicate,
    /// Message could not be interpreted.
    Malformed,
    /// Message had no usable timestamp.
    MissingDate,
    /// Credentials were rejected or could not be renewed.
    AuthFailed,
    /// Session expired and re-authentication was not possible.
    AuthExpired,
    /// Remote side kept throttling past the retry bound.
    RateLimited,
    /// Transient failures exhausted the retry bound.
    TransientExhausted,
    /// Call exceeded its deadline on every attempt.
    Timeout,
    /// Remote side rejected the request permanently.
    Rejected,
    /// Provider was requested but no adapter was configured for it.
    NotConfigured,
    /// Work was abandoned because the run was cancelled.
    Cancelled,
    /// Enrichment source has no data for the identity.
    NotFound,
    /// Enrichment source refused the credentials.
    Unauthorized,
    /// Contact has no email, so it cannot be looked up.
    NoEmail,
    /// Worker task ended without reporting an outcome.
    Internal,
}

impl ReasonCode {
    /// Stable string form, identical to the serialized representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidAddress => "invalid_address",
            Self::NoAddress => "no_address",
            Self::SelfAddress => "self_address",
            Self::Ignored => "ignored",
            Self::MailingList => "mailing_list",
            Self::Duplicate => "duplicate",
            Self::Malformed => "malformed",
            Self::MissingDate => "missing_date",
            Self::AuthFailed => "auth_failed",
            Self::AuthExpired => "auth_expired",
            Self::RateLimited => "rate_limited",
            Self::TransientExhausted => "transient_exhausted",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::NotConfigured => "not_configured",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::NoEmail => "no_email",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
