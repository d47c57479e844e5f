//! Builds a pipeline from the run configuration and stored credentials.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use contactledger_core::credentials;
use contactledger_core::provider::{
    GMAIL_API_BASE, GMAIL_TOKEN_URL, GRAPH_API_BASE, GRAPH_TOKEN_URL, GmailHttp, GraphHttp,
    MissingToken, OAuthRefresher, StaticToken, TokenSource,
};
use contactledger_core::{
    DomainInferenceSource, EnrichmentCache, EnrichmentSource, GmailAdapter, GraphAdapter,
    HunterSource, MemoryCache, Pipeline, ProviderAdapter, ProviderConfig, ProviderKind, RunConfig,
    SqliteCache,
};
use tracing::{debug, info, warn};
use url::Url;

const APP_DIR: &str = "contactledger";

/// Failure detail reported for IMAP accounts.
const IMAP_UNAVAILABLE: &str =
    "no IMAP session implementation ships with this binary; supply one through the contactledger-core library";

/// Default location of the run configuration.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.json"))
}

/// Default location of the persistent enrichment cache.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join(APP_DIR).join("enrichment.db"))
}

/// Loads the run configuration.
///
/// An explicit path must exist. Without one, the default location is used if
/// present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => {
                info!("no config file found, using defaults");
                return Ok(RunConfig::default());
            }
        },
    };

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Adds an adapter for every selected account to `pipeline`.
///
/// The binary ships no IMAP transport, so IMAP accounts are added as
/// unavailable and show up as failed providers in the run summary.
pub fn add_providers(
    mut pipeline: Pipeline,
    config: &RunConfig,
    http: &reqwest::Client,
) -> Result<Pipeline> {
    for account in &config.accounts {
        if !config.selects(&account.name) {
            continue;
        }
        let adapter: ProviderAdapter = match account.kind {
            ProviderKind::Gmail => {
                let api = GmailHttp::new(http.clone(), api_base(account, GMAIL_API_BASE)?);
                GmailAdapter::new(
                    &account.name,
                    &account.account,
                    Box::new(api),
                    token_source(account, http, GMAIL_TOKEN_URL)?,
                )
                .into()
            }
            ProviderKind::Graph => {
                let api = GraphHttp::new(http.clone(), api_base(account, GRAPH_API_BASE)?);
                GraphAdapter::new(
                    &account.name,
                    &account.account,
                    Box::new(api),
                    token_source(account, http, GRAPH_TOKEN_URL)?,
                )
                .into()
            }
            ProviderKind::Imap => {
                warn!(
                    provider = %account.name,
                    account = %account.account,
                    "no IMAP session available, account will not be read"
                );
                pipeline = pipeline.with_unavailable(&account.name, account.kind, IMAP_UNAVAILABLE);
                continue;
            }
        };
        debug!(provider = %account.name, kind = %account.kind, "adapter built");
        pipeline = pipeline.with_adapter(adapter);
    }
    Ok(pipeline)
}

/// API base for `account`, always ending in `/` so relative paths join below it.
fn api_base(account: &ProviderConfig, default: &str) -> Result<Url> {
    let raw = account.api_base.as_deref().unwrap_or(default);
    let raw = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&raw).with_context(|| format!("invalid api_base for provider {}", account.name))
}

fn token_source(
    account: &ProviderConfig,
    http: &reqwest::Client,
    default_token_url: &str,
) -> Result<Arc<dyn TokenSource>> {
    let token = match credentials::get_oauth_token(&account.name) {
        Ok(Some(token)) => token,
        Ok(None) => {
            return Ok(Arc::new(MissingToken(format!(
                "no token stored for {}; run `contactledger store-token`",
                account.name
            ))));
        }
        Err(e) => {
            warn!(provider = %account.name, error = %e, "failed to read token from keyring");
            return Ok(Arc::new(MissingToken(e.to_string())));
        }
    };

    let Some(client_id) = &account.client_id else {
        debug!(provider = %account.name, "no client_id, token will not be refreshed");
        return Ok(Arc::new(StaticToken(token)));
    };
    let token_url = Url::parse(account.token_url.as_deref().unwrap_or(default_token_url))
        .with_context(|| format!("invalid token_url for provider {}", account.name))?;
    Ok(Arc::new(OAuthRefresher::new(
        http.clone(),
        token_url,
        client_id,
        account.client_secret.clone(),
        token,
    )))
}

/// Builds the configured enrichment sources, in preference order.
///
/// Sources whose credentials are missing are left out with a warning.
pub fn build_sources(
    config: &RunConfig,
    http: &reqwest::Client,
    hunter_api_key: Option<&str>,
) -> Result<Vec<Arc<dyn EnrichmentSource>>> {
    let mut sources: Vec<Arc<dyn EnrichmentSource>> = Vec::new();
    for name in &config.enrichment_sources {
        match name.as_str() {
            DomainInferenceSource::NAME => sources.push(Arc::new(DomainInferenceSource::new())),
            HunterSource::NAME => {
                let stored = credentials::get_api_key(HunterSource::NAME).unwrap_or_else(|e| {
                    warn!(error = %e, "failed to read hunter key from keyring");
                    None
                });
                match stored.or_else(|| hunter_api_key.map(ToString::to_string)) {
                    Some(key) => sources.push(Arc::new(HunterSource::with_api_key(http.clone(), key)?)),
                    None => warn!(source = %name, "no API key available, source disabled"),
                }
            }
            other => warn!(source = %other, "unknown enrichment source ignored"),
        }
    }
    Ok(sources)
}

/// Opens the persistent cache, falling back to a per-run memory cache.
pub async fn open_cache(config: &RunConfig) -> Arc<dyn EnrichmentCache> {
    let Some(path) = config.cache_path.clone().or_else(default_cache_path) else {
        warn!("no cache directory available, using a memory cache");
        return Arc::new(MemoryCache::new());
    };

    match open_sqlite(&path).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open cache, using a memory cache");
            Arc::new(MemoryCache::new())
        }
    }
}

async fn open_sqlite(path: &Path) -> Result<SqliteCache> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let cache = SqliteCache::new(path).await?;
    let purged = cache.purge_expired().await?;
    info!(path = %path.display(), purged, "enrichment cache opened");
    Ok(cache)
}
