//! Hunter email-verifier lookups.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::source::{EnrichmentSource, LookupError};
use crate::model::EnrichmentFields;
use crate::provider::{excerpt, retry_after};

/// Default Hunter API base URL.
pub const HUNTER_API_BASE: &str = "https://api.hunter.io/v2/";

/// Verification fields copied into the enrichment result.
const VERIFIER_FIELDS: &[&str] = &["result", "score", "disposable", "webmail", "accept_all"];

#[derive(Debug, Deserialize)]
struct VerifierResponse {
    #[serde(default)]
    data: Option<serde_json::Map<String, Value>>,
}

/// Email deliverability and mailbox type from Hunter.
#[derive(Debug, Clone)]
pub struct HunterSource {
    http: reqwest::Client,
    base: Url,
    api_key: String,
}

impl HunterSource {
    /// Source name used in configuration and cache keys.
    pub const NAME: &'static str = "hunter";

    /// Creates a source against `base` (normally [`HUNTER_API_BASE`]).
    #[must_use]
    pub fn new(http: reqwest::Client, base: Url, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base,
            api_key: api_key.into(),
        }
    }

    /// Creates a source against the public API.
    ///
    /// # Errors
    ///
    /// Returns an error if the built-in base URL fails to parse.
    pub fn with_api_key(
        http: reqwest::Client,
        api_key: impl Into<String>,
    ) -> Result<Self, url::ParseError> {
        Ok(Self::new(http, Url::parse(HUNTER_API_BASE)?, api_key))
    }
}

#[async_trait]
impl EnrichmentSource for HunterSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn confidence(&self) -> f32 {
        0.7
    }

    async fn lookup(
        &self,
        email: &str,
        _domain: Option<&str>,
    ) -> Result<EnrichmentFields, LookupError> {
        let mut url = self
            .base
            .join("email-verifier")
            .map_err(|e| LookupError::Transient(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("email", email)
            .append_pair("api_key", &self.api_key);

        let response = self.http.get(url).send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            debug!(status, body = %excerpt(&body), "hunter lookup refused");
            return Err(error_for_status(status, after, &body));
        }

        let body: VerifierResponse = response
            .json()
            .await
            .map_err(|e| LookupError::Transient(format!("unreadable response: {e}")))?;
        verifier_fields(body)
    }
}

fn error_for_status(status: u16, retry_after: Option<std::time::Duration>, body: &str) -> LookupError {
    match status {
        401 | 403 => LookupError::Unauthorized(excerpt(body)),
        429 => LookupError::RateLimited { retry_after },
        500..=599 => LookupError::Transient(format!("HTTP {status}")),
        // 400 is an address Hunter will not verify; 404 has nothing on it.
        _ => LookupError::NotFound,
    }
}

fn verifier_fields(body: VerifierResponse) -> Result<EnrichmentFields, LookupError> {
    let data = body.data.ok_or(LookupError::NotFound)?;
    let mut fields = EnrichmentFields::new();
    if let Some(status) = data.get("status").filter(|v| !v.is_null()) {
        fields.insert("verification_status".into(), status.clone());
    }
    for key in VERIFIER_FIELDS {
        if let Some(value) = data.get(*key).filter(|v| !v.is_null()) {
            fields.insert((*key).to_string(), value.clone());
        }
    }
    if fields.is_empty() {
        return Err(LookupError::NotFound);
    }
    Ok(fields)
}
