//! Microsoft Graph adapter.
//!
//! Walks the inbox delta query page by page. Graph hands recipients over as
//! structured objects; they are rendered back into header form so every
//! provider feeds the same header parser.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
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

/// Default Graph API base URL.
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0/";

/// Microsoft identity platform token endpoint.
pub const GRAPH_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

const SELECT_FIELDS: &str =
    "id,receivedDateTime,from,toRecipients,ccRecipients,bccRecipients,bodyPreview";

/// One page of a delta query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphPage {
    /// Messages on this page.
    #[serde(default)]
    pub value: Vec<GraphMessage>,
    /// Link to the next page.
    #[serde(default, rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    /// Link for the next incremental sync; present on the last page.
    #[serde(default, rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

/// A message as returned by Graph.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMessage {
    /// Message id.
    pub id: String,
    /// RFC 3339 receive time.
    #[serde(default)]
    pub received_date_time: Option<String>,
    /// Sender.
    #[serde(default)]
    pub from: Option<GraphRecipient>,
    /// Direct recipients.
    #[serde(default)]
    pub to_recipients: Vec<GraphRecipient>,
    /// Copy recipients.
    #[serde(default)]
    pub cc_recipients: Vec<GraphRecipient>,
    /// Blind copy recipients.
    #[serde(default)]
    pub bcc_recipients: Vec<GraphRecipient>,
    /// Body excerpt.
    #[serde(default)]
    pub body_preview: Option<String>,
    /// Set on delta entries for deleted messages.
    #[serde(default, rename = "@removed")]
    pub removed: Option<serde_json::Value>,
}

/// Recipient wrapper.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRecipient {
    /// Address details.
    #[serde(default)]
    pub email_address: Option<GraphEmailAddress>,
}

/// Name and address of a recipient.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphEmailAddress {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// SMTP address.
    #[serde(default)]
    pub address: Option<String>,
}

impl GraphRecipient {
    /// Renders the recipient as a header mailbox.
    fn to_mailbox(&self) -> Option<String> {
        let email = self.email_address.as_ref()?;
        let address = email.address.as_deref().map(str::trim).filter(|a| !a.is_empty());
        let name = email.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
        match (name, address) {
            (Some(name), Some(address)) => Some(format!(
                "\"{}\" <{address}>",
                name.replace('\\', "\\\\").replace('"', "\\\"")
            )),
            (None, Some(address)) => Some(address.to_string()),
            (Some(name), None) => Some(format!("\"{}\"", name.replace('"', "'"))),
            (None, None) => None,
        }
    }
}

/// Graph API surface used by the adapter.
#[async_trait]
pub trait GraphApi: Send + Sync {
    /// Fetches a delta page: the first page when `next_link` is `None`.
    async fn delta_page(
        &self,
        token: &str,
        since: DateTime<Utc>,
        next_link: Option<&str>,
    ) -> Result<GraphPage, ProviderError>;
}

/// [`GraphApi`] over HTTPS.
pub struct GraphHttp {
    http: reqwest::Client,
    base: Url,
}

impl GraphHttp {
    /// Creates a client against `base` (normally [`GRAPH_API_BASE`]).
    #[must_use]
    pub const fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    fn first_page_url(&self, since: DateTime<Utc>) -> Result<Url, ProviderError> {
        let mut url = self
            .base
            .join("me/mailFolders/inbox/messages/delta")
            .map_err(|e| ProviderError::Rejected {
                status: 0,
                detail: e.to_string(),
            })?;
        url.query_pairs_mut()
            .append_pair(
                "$filter",
                &format!(
                    "receivedDateTime ge {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            )
            .append_pair("$select", SELECT_FIELDS);
        Ok(url)
    }
}

#[async_trait]
impl GraphApi for GraphHttp {
    async fn delta_page(
        &self,
        token: &str,
        since: DateTime<Utc>,
        next_link: Option<&str>,
    ) -> Result<GraphPage, ProviderError> {
        let url = match next_link {
            Some(link) => Url::parse(link).map_err(|e| ProviderError::Malformed {
                id: "@odata.nextLink".to_string(),
                reason: e.to_string(),
            })?,
            None => self.first_page_url(since)?,
        };

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("Prefer", "odata.maxpagesize=100")
            .send()
            .await?;
        let response = check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::TransientNetwork(format!("unreadable delta page: {e}")))
    }
}

/// Adapter for one Graph mailbox.
pub struct GraphAdapter {
    name: String,
    account: String,
    api: Box<dyn GraphApi>,
    session: OAuthSession,
}

impl GraphAdapter {
    /// Creates an adapter.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        account: impl Into<String>,
        api: Box<dyn GraphApi>,
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
        let since = range.since;
        let next_link = cursor.map(|c| c.0.as_str());

        let delta = ctx
            .run(&self.name, move || api.delta_page(token, since, next_link))
            .await?;
        debug!(provider = %self.name, count = delta.value.len(), "fetched delta page");

        let mut page = Page {
            next: delta.next_link.map(Cursor),
            ..Page::default()
        };
        for message in delta.value {
            if message.removed.is_some() {
                continue;
            }
            match to_raw_message(message) {
                Ok(raw) if raw.internal_date.is_some_and(|at| !range.contains(at)) => {}
                Ok(raw) => page.messages.push(raw),
                Err((id, e)) => page.skipped.push(SkippedMessage::from_error(id, &e)),
            }
        }
        Ok(page)
    }
}

fn to_raw_message(message: GraphMessage) -> Result<RawMessage, (String, ProviderError)> {
    if message.id.is_empty() {
        return Err((
            String::new(),
            ProviderError::Malformed {
                id: String::new(),
                reason: "message without id".to_string(),
            },
        ));
    }

    let internal_date = match message.received_date_time.as_deref() {
        Some(text) => Some(
            DateTime::parse_from_rfc3339(text)
                .map_err(|e| {
                    (
                        message.id.clone(),
                        ProviderError::Malformed {
                            id: message.id.clone(),
                            reason: format!("receivedDateTime: {e}"),
                        },
                    )
                })?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let mut headers = Headers::new();
    if let Some(from) = message.from.as_ref().and_then(GraphRecipient::to_mailbox) {
        headers.add("From", from);
    }
    for (name, recipients) in [
        ("To", &message.to_recipients),
        ("Cc", &message.cc_recipients),
        ("Bcc", &message.bcc_recipients),
    ] {
        let rendered: Vec<String> = recipients.iter().filter_map(GraphRecipient::to_mailbox).collect();
        if !rendered.is_empty() {
            headers.add(name, rendered.join(", "));
        }
    }

    Ok(RawMessage {
        id: message.id,
        headers,
        internal_date,
        body_excerpt: message.body_preview,
    })
}
