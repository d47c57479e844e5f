//! IMAP adapter over a caller-supplied session.
//!
//! The session is stateful: it logs in once, searches the mailbox by date
//! and fetches header blocks in batches. The pagination cursor is the last
//! UID handed over, so a fresh search can resume where a previous one left off.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use contactledger_mime::Headers;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{AuthState, AuthTracker, Cursor, DateRange, Page, ProviderError, SkippedMessage};
use crate::model::RawMessage;
use crate::retry::CallContext;

/// UIDs fetched per page.
pub const IMAP_FETCH_BATCH: usize = 50;

/// Header section of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapHeaderBlock {
    /// Message UID.
    pub uid: u32,
    /// `INTERNALDATE`, when the server returned it.
    pub internal_date: Option<DateTime<Utc>>,
    /// Raw `BODY.PEEK[HEADER]` text.
    pub header: String,
}

/// Commands the adapter needs from an IMAP connection.
#[async_trait]
pub trait ImapSession: Send {
    /// Authenticates, or re-authenticates after the server dropped the session.
    async fn login(&mut self) -> Result<(), ProviderError>;

    /// `UID SEARCH SINCE <since> BEFORE <before>`.
    async fn uid_search(
        &mut self,
        since: NaiveDate,
        before: NaiveDate,
    ) -> Result<Vec<u32>, ProviderError>;

    /// `UID FETCH <uids> (INTERNALDATE BODY.PEEK[HEADER])`.
    async fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<ImapHeaderBlock>, ProviderError>;
}

struct ImapState {
    session: Box<dyn ImapSession>,
    uids: Option<Vec<u32>>,
}

/// Adapter for one IMAP mailbox.
pub struct ImapAdapter {
    name: String,
    account: String,
    state: Mutex<ImapState>,
    tracker: AuthTracker,
}

impl ImapAdapter {
    /// Creates an adapter around an unauthenticated session.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        account: impl Into<String>,
        session: Box<dyn ImapSession>,
    ) -> Self {
        Self {
            name: name.into(),
            account: account.into(),
            state: Mutex::new(ImapState {
                session,
                uids: None,
            }),
            tracker: AuthTracker::new(),
        }
    }

    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mailbox owner address.
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Session state tracker.
    #[must_use]
    pub const fn tracker(&self) -> &AuthTracker {
        &self.tracker
    }

    async fn login(&self, ctx: &CallContext) -> Result<(), ProviderError> {
        let state = &self.state;
        ctx.run(&self.name, move || async move {
            state.lock().await.session.login().await
        })
        .await
    }

    pub(crate) async fn authenticate(&mut self, ctx: &CallContext) -> Result<(), ProviderError> {
        let result = self.login(ctx).await;
        self.settle(result)
    }

    pub(crate) async fn reauthenticate(&mut self, ctx: &CallContext) -> Result<(), ProviderError> {
        self.tracker.expired();
        self.tracker.begin_reauthentication()?;
        let result = self.login(ctx).await;
        self.settle(result)
    }

    fn settle(&mut self, result: Result<(), ProviderError>) -> Result<(), ProviderError> {
        match result {
            Ok(()) => {
                self.tracker.authenticated();
                Ok(())
            }
            Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
            Err(e) => {
                warn!(provider = %self.name, error = %e, "IMAP login failed");
                self.tracker.failed();
                Err(e)
            }
        }
    }

    pub(crate) async fn list_messages(
        &self,
        range: &DateRange,
        cursor: Option<&Cursor>,
        ctx: &CallContext,
    ) -> Result<Page, ProviderError> {
        if self.tracker.state() != AuthState::Authenticated {
            return Err(ProviderError::AuthFailed("not authenticated".to_string()));
        }
        let after_uid = match cursor {
            Some(cursor) => cursor.0.parse::<u32>().map_err(|_| ProviderError::Malformed {
                id: cursor.0.clone(),
                reason: "IMAP cursor is not a UID".to_string(),
            })?,
            None => 0,
        };

        let (since, before) = range.day_bounds();
        let state = &self.state;
        let (batch, more) = ctx
            .run(&self.name, move || async move {
                let mut guard = state.lock().await;
                if guard.uids.is_none() {
                    let mut found = guard.session.uid_search(since, before).await?;
                    found.sort_unstable();
                    found.dedup();
                    guard.uids = Some(found);
                }
                let pending: Vec<u32> = guard
                    .uids
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .copied()
                    .filter(|uid| *uid > after_uid)
                    .collect();
                let more = pending.len() > IMAP_FETCH_BATCH;
                let batch: Vec<u32> = pending.into_iter().take(IMAP_FETCH_BATCH).collect();
                Ok::<_, ProviderError>((batch, more))
            })
            .await?;

        let Some(&last_uid) = batch.last() else {
            return Ok(Page::default());
        };

        let uids = batch.as_slice();
        let blocks = ctx
            .run(&self.name, move || async move {
                state.lock().await.session.fetch_headers(uids).await
            })
            .await?;
        debug!(provider = %self.name, requested = batch.len(), fetched = blocks.len(), "fetched headers");

        let mut page = Page {
            next: more.then(|| Cursor(last_uid.to_string())),
            ..Page::default()
        };
        for block in blocks {
            let id = block.uid.to_string();
            let headers = Headers::parse(&block.header);
            if headers.is_empty() {
                page.skipped.push(SkippedMessage::from_error(
                    id.clone(),
                    &ProviderError::Malformed {
                        id,
                        reason: "empty header section".to_string(),
                    },
                ));
                continue;
            }
            page.messages.push(RawMessage {
                id,
                headers,
                internal_date: block.internal_date,
                body_excerpt: None,
            });
        }
        Ok(page)
    }
}
