//! Keyed enrichment cache with expiry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::EnrichmentResult;

/// Cache key of `email` looked up in `source`: hex SHA-256 of `source \0 email`.
#[must_use]
pub fn cache_key(source: &str, email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(email.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Expiry instant of an entry stored at `now` for `ttl`; `None` never expires.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// Store for enrichment results.
///
/// `get` returns only entries that have not expired.
#[async_trait]
pub trait EnrichmentCache: Send + Sync {
    /// Fresh entry under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<EnrichmentResult>>;

    /// Stores `result` under `key` for `ttl`.
    async fn put(&self, key: &str, result: &EnrichmentResult, ttl: Duration) -> Result<()>;
}

/// In-process cache, discarded with the run.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (EnrichmentResult, Option<DateTime<Utc>>)>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl EnrichmentCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<EnrichmentResult>> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        match entries.get(key) {
            Some((_, Some(expires))) if now >= *expires => {
                entries.remove(key);
                Ok(None)
            }
            Some((result, _)) => Ok(Some(result.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, result: &EnrichmentResult, ttl: Duration) -> Result<()> {
        let expires = expiry(Utc::now(), ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (result.clone(), expires));
        Ok(())
    }
}
