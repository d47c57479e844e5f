//! Provider-neutral messages and the observations parsed out of them.

use chrono::{DateTime, Utc};
use contactledger_mime::Headers;
use serde::{Deserialize, Serialize};

/// Header role an address was seen in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// `From` header.
    From,
    /// `To` header.
    To,
    /// `Cc` header.
    Cc,
    /// `Bcc` header.
    Bcc,
}

impl Role {
    /// Roles in the order headers are scanned.
    pub const ALL: [Self; 4] = [Self::From, Self::To, Self::Cc, Self::Bcc];

    /// Header name carrying this role.
    #[must_use]
    pub const fn header_name(self) -> &'static str {
        match self {
            Self::From => "From",
            Self::To => "To",
            Self::Cc => "Cc",
            Self::Bcc => "Bcc",
        }
    }
}

/// A message as handed over by a provider adapter.
///
/// Only headers are required. Header values are raw and may still carry
/// RFC 2047 encoded words.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    /// Provider-scoped message id.
    pub id: String,
    /// Header section.
    pub headers: Headers,
    /// Provider-side receive time, preferred over the `Date` header.
    pub internal_date: Option<DateTime<Utc>>,
    /// Short body excerpt, if the provider returned one.
    pub body_excerpt: Option<String>,
}

impl RawMessage {
    /// Creates a message from an id and its headers.
    #[must_use]
    pub fn new(id: impl Into<String>, headers: Headers) -> Self {
        Self {
            id: id.into(),
            headers,
            internal_date: None,
            body_excerpt: None,
        }
    }

    /// Sets the provider-side receive time.
    #[must_use]
    pub const fn with_internal_date(mut self, at: DateTime<Utc>) -> Self {
        self.internal_date = Some(at);
        self
    }
}

/// One sighting of an address (or a bare name) in one message.
///
/// Observations are values: the merge engine reads them, nothing rewrites them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawObservation {
    /// Name of the provider the message came from.
    pub source_provider: String,
    /// Provider-scoped message id.
    pub source_message_id: String,
    /// Header role.
    pub role: Role,
    /// Address exactly as it appeared, if any.
    pub raw_address: Option<String>,
    /// Decoded display name, if any.
    pub raw_display_name: Option<String>,
    /// Timestamp of the message.
    pub observed_at: DateTime<Utc>,
}
