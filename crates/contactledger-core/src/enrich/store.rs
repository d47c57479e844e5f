//! Persistent enrichment cache backed by `SQLite`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::debug;

use super::cache::{EnrichmentCache, expiry};
use crate::error::Result;
use crate::model::EnrichmentResult;

/// Timestamps are stored in one fixed-width UTC form so they compare as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Enrichment cache that survives across runs.
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    /// Opens (or creates) the cache database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(path: &Path) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let cache = Self { pool };
        cache.initialize().await?;
        Ok(cache)
    }

    /// Creates an in-memory cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let cache = Self { pool };
        cache.initialize().await?;
        Ok(cache)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS enrichment_cache (
                cache_key TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                payload TEXT NOT NULL,
                expires_at TEXT,
                stored_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_enrichment_cache_expiry
            ON enrichment_cache(expires_at)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes every expired entry. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM enrichment_cache WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "purged expired enrichment cache entries");
        }
        Ok(removed)
    }

    /// Number of stored entries, expired or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM enrichment_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl EnrichmentCache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<EnrichmentResult>> {
        let row = sqlx::query(
            "SELECT payload, expires_at FROM enrichment_cache WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: Option<String> = row.get("expires_at");
        if let Some(expires_at) = expires_at {
            // An unreadable expiry is treated as stale.
            let fresh = DateTime::parse_from_rfc3339(&expires_at)
                .is_ok_and(|expires| Utc::now() < expires.with_timezone(&Utc));
            if !fresh {
                return Ok(None);
            }
        }

        let payload: String = row.get("payload");
        match serde_json::from_str(&payload) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                debug!(error = %e, "discarding unreadable enrichment cache entry");
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, result: &EnrichmentResult, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let payload = serde_json::to_string(result)?;

        sqlx::query(
            r"
            INSERT INTO enrichment_cache (cache_key, source, payload, expires_at, stored_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                source = excluded.source,
                payload = excluded.payload,
                expires_at = excluded.expires_at,
                stored_at = excluded.stored_at
            ",
        )
        .bind(key)
        .bind(&result.source)
        .bind(payload)
        .bind(expiry(now, ttl).map(timestamp))
        .bind(timestamp(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::enrich::cache::cache_key;
    use crate::model::EnrichmentFields;

    fn result(source: &str) -> EnrichmentResult {
        EnrichmentResult {
            source: source.to_string(),
            fetched_at: Utc::now(),
            fields: EnrichmentFields::from([("score".to_string(), 94.into())]),
            cache_key: cache_key(source, "bob@corp.com"),
            ttl: Duration::from_secs(3600),
            confidence: 0.7,
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let cache = SqliteCache::in_memory().await.unwrap();
        let stored = result("hunter");
        cache
            .put(&stored.cache_key, &stored, Duration::from_secs(3600))
            .await
            .unwrap();

        let loaded = cache.get(&stored.cache_key).await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert!(cache.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let cache = SqliteCache::in_memory().await.unwrap();
        let mut stored = result("hunter");
        cache.put("k", &stored, Duration::from_secs(60)).await.unwrap();
        stored.confidence = 0.9;
        cache.put("k", &stored, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.count().await.unwrap(), 1);
        let loaded = cache.get("k").await.unwrap().unwrap();
        assert!((loaded.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_expired_entries_miss_and_purge() {
        let cache = SqliteCache::in_memory().await.unwrap();
        cache.put("stale", &result("hunter"), Duration::ZERO).await.unwrap();
        cache
            .put("fresh", &result("domain"), Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(cache.get("stale").await.unwrap().is_none());
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.count().await.unwrap(), 1);
        assert!(cache.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires() {
        let cache = SqliteCache::in_memory().await.unwrap();
        cache.put("k", &result("domain"), Duration::MAX).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
    }
}
