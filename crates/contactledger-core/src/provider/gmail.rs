//! Gmail REST adapter.
//!
//! Lists message ids with a date query, then fetches each message in
//! `metadata` format limited to the address headers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use contactledger_mime::Headers;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{
    Cursor, DateRange, OAuthSession, Page, ProviderError, SkippedMessage, TokenSource,
    check_response,
};
use crate::model::RawMessage;
use crate::retry::CallContext;

/// Default Gmail API base URL.
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me/";

/// Google `OAuth2` token endpoint.
pub const GMAIL_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Headers requested for every message.
const METADATA_HEADERS: &[&str] = &["From", "To", "Cc", "Bcc", "Date", "List-Id", "List-Post"];

/// Message ids per listing page.
const PAGE_SIZE: u32 = 100;

/// One page of `users.messages.list`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailListPage {
    /// Message references; absent when the page is empty.
    #[serde(default)]
    pub messages: Vec<GmailMessageRef>,
    /// Token for the next page.
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Reference to a message in a listing.
#[derive(Debug, Clone, Deserialize)]
pub struct GmailMessageRef {
    /// Message id.
    pub id: String,
}

/// A message in `metadata` format.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    /// Message id.
    pub id: String,
    /// Receive time in epoch milliseconds, as a string.
    #[serde(default)]
    pub internal_date: Option<String>,
    /// Short body excerpt.
    #[serde(default)]
    pub snippet: Option<String>,
    /// Header payload.
    #[serde(default)]
    pub payload: Option<GmailPayload>,
}

/// Payload section of a message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GmailPayload {
    /// Requested headers.
    #[serde(default)]
    pub headers: Vec<GmailHeader>,
}

/// One header.
#[derive(Debug, Clone, Deserialize)]
pub struct GmailHeader {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

/// Gmail API surface used by the adapter.
#[async_trait]
pub trait GmailApi: Send + Sync {
    /// Lists message ids matching `query`.
    async fn list_message_ids(
        &self,
        token: &str,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<GmailListPage, ProviderError>;

    /// Fetches one message's metadata.
    async fn get_message(&self, token: &str, id: &str) -> Result<GmailMessage, ProviderError>;
}

/// [`GmailApi`] over HTTPS.
pub struct GmailHttp {
    http: reqwest::Client,
    base: Url,
}

impl GmailHttp {
    /// Creates a client against `base` (normally [`GMAIL_API_BASE`]).
    #[must_use]
    pub const fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }
}

#[async_trait]
impl GmailApi for GmailHttp {
    async fn list_message_ids(
        &self,
        token: &str,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<GmailListPage, ProviderError> {
        let mut url = self.base.join("messages").map_err(|e| ProviderError::Rejected {
            status: 0,
            detail: e.to_string(),
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            pairs.append_pair("maxResults", &PAGE_SIZE.to_string());
            if let Some(page_token) = page_token {
                pairs.append_pair("pageToken", page_token);
            }
        }

        let response = self.http.get(url).bearer_auth(token).send().await?;
        let response = check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::TransientNetwork(format!("unreadable listing: {e}")))
    }

    async fn get_message(&self, token: &str, id: &str) -> Result<GmailMessage, ProviderError> {
        let mut url = self
            .base
            .join(&format!("messages/{id}"))
            .map_err(|e| ProviderError::Malformed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("format", "metadata");
            for header in METADATA_HEADERS {
                pairs.append_pair("metadataHeaders", header);
            }
        }

        let response = self.http.get(url).bearer_auth(token).send().await?;
        let response = match check_response(response).await {
            Err(ProviderError::Rejected { status: 404, .. }) => {
                return Err(ProviderError::Malformed {
                    id: id.to_string(),
                    reason: "message no longer exists".to_string(),
                });
            }
            other => other?,
        };
        response.json().await.map_err(|e| ProviderError::Malformed {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Adapter for one Gmail mailbox.
pub struct GmailAdapter {
    name: String,
    account: String,
    api: Box<dyn GmailApi>,
    session: OAuthSession,
}

impl GmailAdapter {
    /// Creates an adapter.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        account: impl Into<String>,
        api: Box<dyn GmailApi>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            name: name.into(),
            account: account.into(),
            api,
            session: OAuthSession::new(tokens),
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

    /// Token session.
    #[must_use]
    pub const fn session(&self) -> &OAuthSession {
        &self.session
    }

    pub(crate) async fn authenticate(&mut self, ctx: &CallContext) -> Result<(), ProviderError> {
        self.session.authenticate(&self.name, ctx).await
    }

    pub(crate) async fn reauthenticate(&mut self, ctx: &CallContext) -> Result<(), ProviderError> {
        self.session.reauthenticate(&self.name, ctx).await
    }

    pub(crate) async fn list_messages(
        &self,
        range: &DateRange,
        cursor: Option<&Cursor>,
        ctx: &CallContext,
    ) -> Result<Page, ProviderError> {
        let token = self.session.bearer()?;
        let api = self.api.as_ref();
        let query = format!(
            "after:{} before:{}",
            range.since.timestamp(),
            range.until.timestamp()
        );
        let query = query.as_str();
        let page_token = cursor.map(|c| c.0.as_str());

        let listing = ctx
            .run(&self.name, move || api.list_message_ids(token, query, page_token))
            .await?;
        debug!(
            provider = %self.name,
            count = listing.messages.len(),
            "listed message ids"
        );

        let mut page = Page {
            next: listing.next_page_token.map(Cursor),
            ..Page::default()
        };
        for reference in &listing.messages {
            let id = reference.id.as_str();
            match ctx.run(&self.name, move || api.get_message(token, id)).await {
                Ok(message) => match to_raw_message(message) {
                    Ok(raw) => page.messages.push(raw),
                    Err(e) => page.skipped.push(SkippedMessage::from_error(id, &e)),
                },
                // A message can vanish between listing and fetching (404).
                Err(
                    e @ (ProviderError::Malformed { .. }
                    | ProviderError::Rejected { .. }
                    | ProviderError::TransientNetwork(_)
                    | ProviderError::Timeout(_)),
                ) => page.skipped.push(SkippedMessage::from_error(id, &e)),
                Err(e) => return Err(e),
            }
        }
        Ok(page)
    }
}

fn to_raw_message(message: GmailMessage) -> Result<RawMessage, ProviderError> {
    let payload = message.payload.ok_or_else(|| ProviderError::Malformed {
        id: message.id.clone(),
        reason: "message has no payload".to_string(),
    })?;
    let headers: Headers = payload
        .headers
        .into_iter()
        .map(|header| (header.name, header.value))
        .collect();
    let internal_date = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis);

    Ok(RawMessage {
        id: message.id,
        headers,
        internal_date,
        body_excerpt: message.snippet,
    })
}
