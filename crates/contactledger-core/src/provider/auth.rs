//! Session state and `OAuth2` token handling for provider adapters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{ProviderError, check_response};
use crate::retry::CallContext;

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Authentication state of one provider session.
///
/// ```text
/// Unauthenticated → Authenticated → Expired → Reauthenticating → Authenticated
///        │                                           │
///        └──────────────────→ Failed ←───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No session yet.
    Unauthenticated,
    /// Session usable.
    Authenticated,
    /// Session rejected by the provider.
    Expired,
    /// Renewal in progress.
    Reauthenticating,
    /// Session cannot be (re-)established.
    Failed,
}

/// Tracks session state and enforces the re-authentication budget.
#[derive(Debug, Clone)]
pub struct AuthTracker {
    state: AuthState,
    reauthentications: u32,
    max_reauthentications: u32,
}

impl Default for AuthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthTracker {
    /// Creates a tracker allowing one re-authentication.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            reauthentications: 0,
            max_reauthentications: 1,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Re-authentications started so far.
    #[must_use]
    pub const fn reauthentications(&self) -> u32 {
        self.reauthentications
    }

    /// Records a successful (re-)authentication.
    pub fn authenticated(&mut self) {
        self.transition(AuthState::Authenticated);
    }

    /// Records that the session cannot be established.
    pub fn failed(&mut self) {
        self.transition(AuthState::Failed);
    }

    /// Records that the provider rejected the session.
    pub fn expired(&mut self) {
        if self.state == AuthState::Authenticated {
            self.transition(AuthState::Expired);
        }
    }

    /// Starts a re-authentication if the budget allows it.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AuthFailed`] and moves to `Failed` when the
    /// session is not expired or the budget is spent.
    pub fn begin_reauthentication(&mut self) -> Result<(), ProviderError> {
        if self.state != AuthState::Expired {
            return Err(ProviderError::AuthFailed(format!(
                "cannot re-authenticate from state {:?}",
                self.state
            )));
        }
        if self.reauthentications >= self.max_reauthentications {
            self.failed();
            return Err(ProviderError::AuthFailed(
                "session expired again after re-authentication".to_string(),
            ));
        }
        self.reauthentications += 1;
        self.transition(AuthState::Reauthenticating);
        Ok(())
    }

    fn transition(&mut self, next: AuthState) {
        debug!(from = ?self.state, to = ?next, "auth state change");
        self.state = next;
    }
}

/// `OAuth2` access token as stored in the keyring.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessToken {
    /// Bearer token.
    pub access_token: String,
    /// Refresh token, when the grant issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry instant, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    /// Creates a token without expiry or refresh token.
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Sets the refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Sets the expiry instant.
    #[must_use]
    pub const fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Checks if the token is expired (with 60 second buffer).
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Same as [`Self::is_expired`] against an explicit clock.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|exp| now + Duration::seconds(EXPIRY_MARGIN_SECS) >= exp)
    }
}

/// Supplies access tokens to an adapter.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a token believed to be valid.
    async fn token(&self) -> Result<AccessToken, ProviderError>;

    /// Returns a fresh token after `stale` was rejected.
    async fn refresh(&self, stale: Option<&AccessToken>) -> Result<AccessToken, ProviderError>;
}

/// A fixed token that cannot be renewed.
#[derive(Debug, Clone)]
pub struct StaticToken(pub AccessToken);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<AccessToken, ProviderError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self, _stale: Option<&AccessToken>) -> Result<AccessToken, ProviderError> {
        Err(ProviderError::AuthFailed("token cannot be refreshed".to_string()))
    }
}

/// Stands in for credentials that are not available.
#[derive(Debug, Clone)]
pub struct MissingToken(pub String);

#[async_trait]
impl TokenSource for MissingToken {
    async fn token(&self) -> Result<AccessToken, ProviderError> {
        Err(ProviderError::AuthFailed(self.0.clone()))
    }

    async fn refresh(&self, _stale: Option<&AccessToken>) -> Result<AccessToken, ProviderError> {
        Err(ProviderError::AuthFailed(self.0.clone()))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Refreshes tokens against an `OAuth2` token endpoint.
pub struct OAuthRefresher {
    http: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: Option<String>,
    current: Mutex<AccessToken>,
}

impl OAuthRefresher {
    /// Creates a refresher seeded with a stored token.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        token_url: Url,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        token: AccessToken,
    ) -> Self {
        Self {
            http,
            token_url,
            client_id: client_id.into(),
            client_secret,
            current: Mutex::new(token),
        }
    }

    /// Latest token, including any refresh done during the run.
    pub async fn current(&self) -> AccessToken {
        self.current.lock().await.clone()
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<AccessToken, ProviderError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", self.client_id.as_str());
        if let Some(secret) = &self.client_secret {
            params.insert("client_secret", secret.as_str());
        }

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&params)
            .send()
            .await?;
        let response = match check_response(response).await {
            Ok(response) => response,
            // The token endpoint answers 400/401 for revoked or invalid grants.
            Err(ProviderError::AuthExpired | ProviderError::Rejected { .. }) => {
                return Err(ProviderError::AuthFailed("refresh token rejected".to_string()));
            }
            Err(e) => return Err(e),
        };

        let body: TokenResponse = response.json().await?;
        let mut token = AccessToken::new(body.access_token);
        token.expires_at = body
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));
        // Preserve refresh token if not returned
        token.refresh_token = body.refresh_token.or_else(|| Some(refresh_token.to_string()));
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for OAuthRefresher {
    async fn token(&self) -> Result<AccessToken, ProviderError> {
        let current = self.current().await;
        if current.is_expired() {
            debug!("stored token expired, refreshing before first use");
            self.refresh(Some(&current)).await
        } else {
            Ok(current)
        }
    }

    async fn refresh(&self, stale: Option<&AccessToken>) -> Result<AccessToken, ProviderError> {
        let stored = self.current().await;
        let refresh_token = stale
            .and_then(|t| t.refresh_token.clone())
            .or(stored.refresh_token)
            .ok_or_else(|| ProviderError::AuthFailed("no refresh token available".to_string()))?;

        let token = self.request_refresh(&refresh_token).await?;
        *self.current.lock().await = token.clone();
        info!("access token refreshed");
        Ok(token)
    }
}

/// Token-based session shared by the REST adapters.
pub struct OAuthSession {
    tokens: Arc<dyn TokenSource>,
    current: Option<AccessToken>,
    tracker: AuthTracker,
}

impl OAuthSession {
    /// Creates an unauthenticated session.
    #[must_use]
    pub fn new(tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            tokens,
            current: None,
            tracker: AuthTracker::new(),
        }
    }

    /// Session state tracker.
    #[must_use]
    pub const fn tracker(&self) -> &AuthTracker {
        &self.tracker
    }

    /// Obtains the initial token.
    ///
    /// # Errors
    ///
    /// Returns the error from the token source.
    pub async fn authenticate(&mut self, label: &str, ctx: &CallContext) -> Result<(), ProviderError> {
        let tokens = &self.tokens;
        let result = ctx.run(label, move || tokens.token()).await;
        self.settle(label, result)
    }

    /// Renews the token after the provider rejected it.
    ///
    /// # Errors
    ///
    /// Fails when the re-authentication budget is spent or renewal fails.
    pub async fn reauthenticate(&mut self, label: &str, ctx: &CallContext) -> Result<(), ProviderError> {
        self.tracker.expired();
        self.tracker.begin_reauthentication()?;
        let stale = self.current.take();
        let stale = &stale;
        let tokens = &self.tokens;
        let result = ctx
            .run(label, move || tokens.refresh(stale.as_ref()))
            .await;
        self.settle(label, result)
    }

    fn settle(
        &mut self,
        label: &str,
        result: Result<AccessToken, ProviderError>,
    ) -> Result<(), ProviderError> {
        match result {
            Ok(token) => {
                self.current = Some(token);
                self.tracker.authenticated();
                Ok(())
            }
            Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
            Err(e) => {
                warn!(provider = label, error = %e, "authentication failed");
                self.tracker.failed();
                Err(e)
            }
        }
    }

    /// Bearer token for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AuthExpired`] when the token is about to
    /// expire, so the adapter renews it before the provider rejects it.
    pub fn bearer(&self) -> Result<&str, ProviderError> {
        match (&self.current, self.tracker.state()) {
            (Some(token), AuthState::Authenticated) if token.is_expired() => {
                Err(ProviderError::AuthExpired)
            }
            (Some(token), AuthState::Authenticated) => Ok(&token.access_token),
            _ => Err(ProviderError::AuthFailed("not authenticated".to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CallContext {
        CallContext::new(
            RetryPolicy::immediate(3),
            std::time::Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    struct CountingRefresh {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl TokenSource for CountingRefresh {
        async fn token(&self) -> Result<AccessToken, ProviderError> {
            Ok(AccessToken::new("first"))
        }

        async fn refresh(&self, stale: Option<&AccessToken>) -> Result<AccessToken, ProviderError> {
            assert_eq!(stale.map(|t| t.access_token.as_str()), Some("first"));
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken::new(format!("renewed-{n}")))
        }
    }

    #[test]
    fn test_tracker_allows_one_reauthentication() {
        let mut tracker = AuthTracker::new();
        assert_eq!(tracker.state(), AuthState::Unauthenticated);
        tracker.authenticated();
        tracker.expired();
        assert_eq!(tracker.state(), AuthState::Expired);
        tracker.begin_reauthentication().unwrap();
        assert_eq!(tracker.state(), AuthState::Reauthenticating);
        tracker.authenticated();
        tracker.expired();
        assert!(tracker.begin_reauthentication().is_err());
        assert_eq!(tracker.state(), AuthState::Failed);
        assert_eq!(tracker.reauthentications(), 1);
    }

    #[test]
    fn test_reauthentication_requires_expiry() {
        let mut tracker = AuthTracker::new();
        assert!(tracker.begin_reauthentication().is_err());
    }

    #[test]
    fn test_token_expiry_margin() {
        let now = Utc::now();
        let token = AccessToken::new("t").with_expires_at(now + Duration::seconds(30));
        assert!(token.is_expired_at(now));
        let token = AccessToken::new("t").with_expires_at(now + Duration::seconds(120));
        assert!(!token.is_expired_at(now));
        assert!(!AccessToken::new("t").is_expired());
    }

    #[test]
    fn test_token_debug_redacts() {
        let token = AccessToken::new("secret").with_refresh_token("also-secret");
        let debug = format!("{token:?}");
        assert!(!debug.contains("secret\""));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_token_json_round_trip() {
        let json = r#"{"access_token":"abc","refresh_token":"r"}"#;
        let token: AccessToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.refresh_token.as_deref(), Some("r"));
        assert!(token.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_session_reauthenticates_once() {
        let source = Arc::new(CountingRefresh {
            refreshes: AtomicU32::new(0),
        });
        let mut session = OAuthSession::new(source.clone());
        assert!(session.bearer().is_err());

        session.authenticate("work", &ctx()).await.unwrap();
        assert_eq!(session.bearer().unwrap(), "first");

        session.reauthenticate("work", &ctx()).await.unwrap();
        assert_eq!(session.bearer().unwrap(), "renewed-0");
        assert_eq!(session.tracker().reauthentications(), 1);

        let err = session.reauthenticate("work", &ctx()).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthFailed(_)));
        assert_eq!(session.tracker().state(), AuthState::Failed);
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_token_fails_authentication() {
        let mut session = OAuthSession::new(Arc::new(MissingToken("no token stored".into())));
        let err = session.authenticate("work", &ctx()).await.unwrap_err();
        assert_eq!(err, ProviderError::AuthFailed("no token stored".into()));
        assert_eq!(session.tracker().state(), AuthState::Failed);
    }

    #[tokio::test]
    async fn test_expiring_token_reported_as_expired() {
        let soon = AccessToken::new("t").with_expires_at(Utc::now() + Duration::seconds(10));
        let mut session = OAuthSession::new(Arc::new(StaticToken(soon)));
        session.authenticate("work", &ctx()).await.unwrap();
        assert_eq!(session.bearer(), Err(ProviderError::AuthExpired));
    }
}
