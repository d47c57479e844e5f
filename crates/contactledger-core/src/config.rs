//! Run configuration.
//!
//! A run is fully described by a [`RunConfig`]. The CLI loads it from JSON;
//! library users build it in code. Every field has a default, so a config file
//! only needs the keys it overrides.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;
use crate::retry::RetryPolicy;

/// Default look-back window in days.
pub const DEFAULT_DAYS_BACK: u32 = 30;

/// Default enrichment worker pool size.
pub const DEFAULT_WORKERS: usize = 8;

/// Default concurrent calls per enrichment source.
pub const DEFAULT_SOURCE_CONCURRENCY: usize = 4;

/// Default enrichment cache TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default deadline for one remote call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Messages from the last `days_back` days are extracted.
    pub days_back: u32,
    /// Providers to run, by name. Empty selects every configured account.
    pub providers: BTreeSet<String>,
    /// Mail accounts the CLI builds adapters for.
    pub accounts: Vec<ProviderConfig>,
    /// Whether to run the enrichment stage.
    pub enrich: bool,
    /// Enrichment sources to use, by name, in preference order.
    pub enrichment_sources: Vec<String>,
    /// Concurrent calls per source; unlisted sources use the default.
    pub max_concurrency_per_source: BTreeMap<String, usize>,
    /// Freshness of cached enrichment results.
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Enrichment worker pool size.
    pub workers: usize,
    /// Rate budget per source; unlisted sources use [`RateLimitConfig::default`].
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    /// Deadline for one remote call.
    #[serde(with = "duration_secs", rename = "operation_timeout_secs")]
    pub operation_timeout: Duration,
    /// Retry policy shared by providers and sources.
    pub retry: RetryPolicy,
    /// Stop extracting a provider after this many messages.
    pub max_messages_per_provider: Option<usize>,
    /// Identity normalization rules.
    pub normalize: NormalizeConfig,
    /// Automated-sender filters.
    pub ignore: IgnoreRules,
    /// Location of the persistent enrichment cache.
    pub cache_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            days_back: DEFAULT_DAYS_BACK,
            providers: BTreeSet::new(),
            accounts: Vec::new(),
            enrich: false,
            enrichment_sources: vec!["domain".to_string()],
            max_concurrency_per_source: BTreeMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
            workers: DEFAULT_WORKERS,
            rate_limits: BTreeMap::new(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            retry: RetryPolicy::default(),
            max_messages_per_provider: None,
            normalize: NormalizeConfig::default(),
            ignore: IgnoreRules::default(),
            cache_path: None,
        }
    }
}

impl RunConfig {
    /// Rate budget for `source`.
    #[must_use]
    pub fn rate_limit_for(&self, source: &str) -> RateLimitConfig {
        self.rate_limits.get(source).copied().unwrap_or_default()
    }

    /// Concurrent calls allowed for `source`, never above its rate limit.
    #[must_use]
    pub fn concurrency_for(&self, source: &str) -> usize {
        let configured = self
            .max_concurrency_per_source
            .get(source)
            .copied()
            .unwrap_or(DEFAULT_SOURCE_CONCURRENCY);
        let limit = usize::try_from(self.rate_limit_for(source).limit).unwrap_or(usize::MAX);
        configured.min(limit).max(1)
    }

    /// Returns true if the named provider takes part in the run.
    #[must_use]
    pub fn selects(&self, provider: &str) -> bool {
        self.providers.is_empty() || self.providers.contains(provider)
    }

    /// Validates the configuration, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// Returns all validation errors found.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if self.days_back == 0 {
            errors.push(ConfigError::InvalidDaysBack);
        }
        if self.workers == 0 {
            errors.push(ConfigError::NoWorkers);
        }
        if self.retry.max_attempts == 0 {
            errors.push(ConfigError::InvalidRetryAttempts);
        }
        if self.operation_timeout.is_zero() {
            errors.push(ConfigError::InvalidTimeout);
        }

        for (source, limit) in &self.rate_limits {
            if limit.limit == 0 || limit.window.is_zero() {
                errors.push(ConfigError::InvalidRateLimit {
                    name: source.clone(),
                });
            }
        }
        for (source, concurrency) in &self.max_concurrency_per_source {
            if *concurrency == 0 {
                errors.push(ConfigError::ZeroConcurrency {
                    name: source.clone(),
                });
            }
        }

        let mut names = BTreeSet::new();
        for account in &self.accounts {
            if account.name.trim().is_empty() {
                errors.push(ConfigError::EmptyAccountName);
            } else if !names.insert(account.name.as_str()) {
                errors.push(ConfigError::DuplicateAccount {
                    name: account.name.clone(),
                });
            }
            if account.account.trim().is_empty() {
                errors.push(ConfigError::EmptyAccountAddress {
                    name: account.name.clone(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Connection details for one mail account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name used in summaries and provenance.
    pub name: String,
    /// Which adapter to build.
    pub kind: ProviderKind,
    /// Address of the mailbox owner; excluded from the contact set.
    pub account: String,
    /// `OAuth2` client id used to refresh expired tokens.
    #[serde(default)]
    pub client_id: Option<String>,
    /// `OAuth2` client secret, when the client is confidential.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// `OAuth2` token endpoint; defaults per provider kind.
    #[serde(default)]
    pub token_url: Option<String>,
    /// API base URL override.
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Per-source request budget: at most `limit` calls in any `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed per window.
    pub limit: u32,
    /// Window length.
    #[serde(with = "duration_secs", rename = "window_secs")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Rules the normalizer applies to addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Characters that start a subaddress tag in the local part.
    pub subaddress_separators: Vec<char>,
    /// Domains where the subaddress tag is part of the mailbox.
    pub subaddress_exempt_domains: BTreeSet<String>,
    /// Alias domain to canonical domain.
    pub alias_domains: BTreeMap<String, String>,
    /// Domains whose local parts ignore dots.
    pub dot_insensitive_domains: BTreeSet<String>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            subaddress_separators: vec!['+'],
            subaddress_exempt_domains: BTreeSet::new(),
            alias_domains: BTreeMap::from([("googlemail.com".to_string(), "gmail.com".to_string())]),
            dot_insensitive_domains: BTreeSet::from(["gmail.com".to_string()]),
        }
    }
}

/// Filters for automated senders.
///
/// Matched against lowercase addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreRules {
    /// Local parts starting with any of these are ignored.
    pub local_prefixes: Vec<String>,
    /// Local parts ending with any of these are ignored.
    pub local_suffixes: Vec<String>,
    /// Full addresses ending with any of these are ignored.
    pub address_suffixes: Vec<String>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(ToString::to_string).collect();
        Self {
            local_prefixes: owned(&[
                "noreply",
                "no-reply",
                "no_reply",
                "donotreply",
                "do-not-reply",
                "do_not_reply",
                "mailer-daemon",
                "postmaster",
                "bounce",
                "notifications",
                "newsletter",
            ]),
            local_suffixes: owned(&["-bounces", "-request", "-owner", "-noreply"]),
            address_suffixes: owned(&["@noreply.github.com", ".noreply.github.com"]),
        }
    }
}

impl IgnoreRules {
    /// Rules that ignore nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            local_prefixes: Vec::new(),
            local_suffixes: Vec::new(),
            address_suffixes: Vec::new(),
        }
    }

    /// Returns true if the lowercase `address` matches any rule.
    #[must_use]
    pub fn matches(&self, address: &str) -> bool {
        let local = address.rsplit_once('@').map_or(address, |(local, _)| local);
        self.local_prefixes.iter().any(|p| local.starts_with(p.as_str()))
            || self.local_suffixes.iter().any(|s| local.ends_with(s.as_str()))
            || self.address_suffixes.iter().any(|s| address.ends_with(s.as_str()))
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `days_back` is zero.
    #[error("days_back must be at least 1")]
    InvalidDaysBack,
    /// Worker pool is empty.
    #[error("workers must be at least 1")]
    NoWorkers,
    /// Retry policy allows no attempt.
    #[error("retry.max_attempts must be at least 1")]
    InvalidRetryAttempts,
    /// Operation timeout is zero.
    #[error("operation_timeout_secs must be at least 1")]
    InvalidTimeout,
    /// Rate budget allows no call.
    #[error("rate limit for source '{name}' must allow at least one call per non-empty window")]
    InvalidRateLimit {
        /// Source name.
        name: String,
    },
    /// Source concurrency is zero.
    #[error("max_concurrency_per_source for '{name}' must be at least 1")]
    ZeroConcurrency {
        /// Source name.
        name: String,
    },
    /// Account has no name.
    #[error("account name is required")]
    EmptyAccountName,
    /// Two accounts share a name.
    #[error("account name '{name}' is used more than once")]
    DuplicateAccount {
        /// Account name.
        name: String,
    },
    /// Account has no mailbox address.
    #[error("account '{name}' needs a mailbox address")]
    EmptyAccountAddress {
        /// Account name.
        name: String,
    },
}

impl ConfigError {
    /// Config key this error relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::InvalidDaysBack => "days_back",
            Self::NoWorkers => "workers",
            Self::InvalidRetryAttempts => "retry.max_attempts",
            Self::InvalidTimeout => "operation_timeout_secs",
            Self::InvalidRateLimit { .. } => "rate_limits",
            Self::ZeroConcurrency { .. } => "max_concurrency_per_source",
            Self::EmptyAccountName | Self::DuplicateAccount { .. } => "accounts.name",
            Self::EmptyAccountAddress { .. } => "accounts.account",
        }
    }
}

/// Serde helper storing a [`Duration`] as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as whole seconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    /// Deserializes from whole seconds.
    ///
    /// # Errors
    ///
    /// Fails if the value is not an unsigned integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as whole milliseconds, saturating at `u64::MAX`.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserializes from whole milliseconds.
    ///
    /// # Errors
    ///
    /// Fails if the value is not an unsigned integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
