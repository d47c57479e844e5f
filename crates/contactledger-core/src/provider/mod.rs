//! Mail provider adapters.
//!
//! Each adapter turns one mailbox into a stream of [`RawMessage`] pages.
//! Adapters differ in transport and authentication but share the same
//! contract:
//!
//! - [`ProviderAdapter::authenticate`] establishes a session
//! - [`ProviderAdapter::fetch_page`] returns one page plus a resumable cursor,
//!   re-authenticating at most once when the session expires mid-run
//! - every remote call is retried, time-boxed and cancellable through a
//!   [`CallContext`]
//!
//! A message the adapter cannot interpret is reported in
//! [`Page::skipped`] instead of failing the page.

mod auth;
mod gmail;
mod graph;
mod imap;

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use auth::{
    AccessToken, AuthState, AuthTracker, MissingToken, OAuthRefresher, OAuthSession, StaticToken,
    TokenSource,
};
pub use gmail::{
    GMAIL_API_BASE, GMAIL_TOKEN_URL, GmailAdapter, GmailApi, GmailHeader, GmailHttp,
    GmailListPage, GmailMessage, GmailMessageRef, GmailPayload,
};
pub use graph::{
    GRAPH_API_BASE, GRAPH_TOKEN_URL, GraphAdapter, GraphApi, GraphEmailAddress, GraphHttp,
    GraphMessage, GraphPage, GraphRecipient,
};
pub use imap::{IMAP_FETCH_BATCH, ImapAdapter, ImapHeaderBlock, ImapSession};

use crate::model::{RawMessage, ReasonCode};
use crate::retry::{CallContext, RetryClass, Retryable};

/// Kind of mail provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Gmail REST API.
    Gmail,
    /// Microsoft Graph mail API.
    Graph,
    /// IMAP session.
    Imap,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Gmail => "gmail",
            Self::Graph => "graph",
            Self::Imap => "imap",
        })
    }
}

/// Failure of a provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Session is no longer valid; one re-authentication is allowed.
    #[error("session expired")]
    AuthExpired,

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Provider is throttling.
    #[error("rate limited by provider")]
    RateLimited {
        /// Provider's retry-after instruction.
        retry_after: Option<Duration>,
    },

    /// Network or server trouble that may go away.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Response could not be interpreted.
    #[error("malformed response for {id}: {reason}")]
    Malformed {
        /// Message id, or the request that failed.
        id: String,
        /// What was wrong.
        reason: String,
    },

    /// Provider refused the request for good.
    #[error("request rejected with HTTP {status}: {detail}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Response excerpt.
        detail: String,
    },

    /// Run was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Maps an HTTP error status onto the error taxonomy.
    #[must_use]
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        match status {
            401 => Self::AuthExpired,
            403 => Self::AuthFailed(excerpt(body)),
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::TransientNetwork(format!("HTTP {status}")),
            _ => Self::Rejected {
                status,
                detail: excerpt(body),
            },
        }
    }

    /// Reason code recorded when this error ends a provider's run.
    #[must_use]
    pub const fn reason_code(&self) -> ReasonCode {
        match self {
            Self::AuthExpired => ReasonCode::AuthExpired,
            Self::AuthFailed(_) => ReasonCode::AuthFailed,
            Self::RateLimited { .. } => ReasonCode::RateLimited,
            Self::TransientNetwork(_) => ReasonCode::TransientExhausted,
            Self::Timeout(_) => ReasonCode::Timeout,
            Self::Malformed { .. } => ReasonCode::Malformed,
            Self::Rejected { .. } => ReasonCode::Rejected,
            Self::Cancelled => ReasonCode::Cancelled,
        }
    }
}

impl Retryable for ProviderError {
    fn retry_class(&self) -> RetryClass {
        match self {
            Self::TransientNetwork(_) | Self::Timeout(_) => RetryClass::Transient,
            Self::RateLimited { retry_after } => RetryClass::RateLimited(*retry_after),
            Self::AuthExpired
            | Self::AuthFailed(_)
            | Self::Malformed { .. }
            | Self::Rejected { .. }
            | Self::Cancelled => RetryClass::Permanent,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Malformed {
                id: error
                    .url()
                    .map_or_else(|| "response".to_string(), |url| url.path().to_string()),
                reason: error.to_string(),
            }
        } else {
            Self::TransientNetwork(error.to_string())
        }
    }
}

/// Turns a non-success response into a [`ProviderError`].
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), after, &body))
}

/// Parses a `Retry-After` header given in seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn excerpt(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Time window of messages to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    /// Inclusive lower bound.
    pub since: DateTime<Utc>,
    /// Exclusive upper bound.
    pub until: DateTime<Utc>,
}

impl DateRange {
    /// The `days` days before `now`.
    #[must_use]
    pub fn last_days(days: u32, now: DateTime<Utc>) -> Self {
        Self {
            since: now - chrono::Duration::days(i64::from(days)),
            until: now,
        }
    }

    /// Returns true if `at` falls inside the range.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since <= at && at < self.until
    }

    /// Day-granular bounds for protocols that search by date (`SINCE`, `BEFORE`).
    #[must_use]
    pub fn day_bounds(&self) -> (NaiveDate, NaiveDate) {
        let before = self.until.date_naive().succ_opt().unwrap_or(NaiveDate::MAX);
        (self.since.date_naive(), before)
    }
}

/// Opaque position in a provider's message listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

/// A message the adapter could not hand over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMessage {
    /// Provider-scoped message id.
    pub message_id: String,
    /// Why it was skipped.
    pub reason: ReasonCode,
    /// Human-readable detail.
    pub detail: String,
}

impl SkippedMessage {
    /// Records a skip caused by `error`.
    #[must_use]
    pub fn from_error(message_id: impl Into<String>, error: &ProviderError) -> Self {
        Self {
            message_id: message_id.into(),
            reason: error.reason_code(),
            detail: error.to_string(),
        }
    }
}

/// One page of messages.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Messages in provider order.
    pub messages: Vec<RawMessage>,
    /// Messages that could not be interpreted.
    pub skipped: Vec<SkippedMessage>,
    /// Where the next page starts; `None` at the end.
    pub next: Option<Cursor>,
}

/// A configured mail provider.
pub enum ProviderAdapter {
    /// Gmail REST API.
    Gmail(GmailAdapter),
    /// Microsoft Graph.
    Graph(GraphAdapter),
    /// IMAP.
    Imap(ImapAdapter),
}

impl ProviderAdapter {
    /// Provider name used in summaries and provenance.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Gmail(a) => a.name(),
            Self::Graph(a) => a.name(),
            Self::Imap(a) => a.name(),
        }
    }

    /// Kind of provider.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Gmail(_) => ProviderKind::Gmail,
            Self::Graph(_) => ProviderKind::Graph,
            Self::Imap(_) => ProviderKind::Imap,
        }
    }

    /// Address of the mailbox owner.
    #[must_use]
    pub fn account(&self) -> &str {
        match self {
            Self::Gmail(a) => a.account(),
            Self::Graph(a) => a.account(),
            Self::Imap(a) => a.account(),
        }
    }

    /// Current session state.
    #[must_use]
    pub const fn auth_state(&self) -> AuthState {
        self.tracker().state()
    }

    /// Re-authentications performed so far.
    #[must_use]
    pub const fn reauthentications(&self) -> u32 {
        self.tracker().reauthentications()
    }

    const fn tracker(&self) -> &AuthTracker {
        match self {
            Self::Gmail(a) => a.session().tracker(),
            Self::Graph(a) => a.session().tracker(),
            Self::Imap(a) => a.tracker(),
        }
    }

    /// Establishes a session.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented authentication.
    pub async fn authenticate(&mut self, ctx: &CallContext) -> Result<(), ProviderError> {
        match self {
            Self::Gmail(a) => a.authenticate(ctx).await,
            Self::Graph(a) => a.authenticate(ctx).await,
            Self::Imap(a) => a.authenticate(ctx).await,
        }
    }

    async fn reauthenticate(&mut self, ctx: &CallContext) -> Result<(), ProviderError> {
        match self {
            Self::Gmail(a) => a.reauthenticate(ctx).await,
            Self::Graph(a) => a.reauthenticate(ctx).await,
            Self::Imap(a) => a.reauthenticate(ctx).await,
        }
    }

    async fn list_messages(
        &self,
        range: &DateRange,
        cursor: Option<&Cursor>,
        ctx: &CallContext,
    ) -> Result<Page, ProviderError> {
        match self {
            Self::Gmail(a) => a.list_messages(range, cursor, ctx).await,
            Self::Graph(a) => a.list_messages(range, cursor, ctx).await,
            Self::Imap(a) => a.list_messages(range, cursor, ctx).await,
        }
    }

    /// Fetches the page starting at `cursor`.
    ///
    /// An expired session triggers one re-authentication and a retry of the
    /// same page. A second expiry fails the provider.
    ///
    /// # Errors
    ///
    /// Returns the error that ended extraction for this provider.
    pub async fn fetch_page(
        &mut self,
        range: &DateRange,
        cursor: Option<&Cursor>,
        ctx: &CallContext,
    ) -> Result<Page, ProviderError> {
        loop {
            match self.list_messages(range, cursor, ctx).await {
                Err(ProviderError::AuthExpired) => {
                    warn!(provider = %self.name(), "session expired, re-authenticating");
                    self.reauthenticate(ctx).await?;
                }
                other => return other,
            }
        }
    }
}

impl From<GmailAdapter> for ProviderAdapter {
    fn from(adapter: GmailAdapter) -> Self {
        Self::Gmail(adapter)
    }
}

impl From<GraphAdapter> for ProviderAdapter {
    fn from(adapter: GraphAdapter) -> Self {
        Self::Graph(adapter)
    }
}

impl From<ImapAdapter> for ProviderAdapter {
    fn from(adapter: ImapAdapter) -> Self {
        Self::Imap(adapter)
    }
}
