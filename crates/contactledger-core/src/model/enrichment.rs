//! Enrichment results attached to contacts.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribute name to value, as returned by a source.
pub type EnrichmentFields = BTreeMap<String, serde_json::Value>;

/// Data fetched from one enrichment source for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    /// Source that produced the data.
    pub source: String,
    /// When the source answered.
    pub fetched_at: DateTime<Utc>,
    /// Attributes returned by the source.
    pub fields: EnrichmentFields,
    /// Cache key the result is stored under.
    pub cache_key: String,
    /// How long the result stays fresh.
    #[serde(with = "crate::config::duration_secs")]
    pub ttl: Duration,
    /// Source confidence in `[0, 1]`.
    pub confidence: f32,
}

impl EnrichmentResult {
    /// Instant after which the result is stale.
    ///
    /// `None` when the TTL is too large to represent, which never expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.fetched_at.checked_add_signed(ttl))
    }

    /// Returns true once `now` has reached the expiry instant.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires| now >= expires)
    }

    /// Returns true if this result should replace `other` on a contact.
    ///
    /// Higher confidence wins; equal confidence falls back to source name so
    /// the outcome does not depend on which lookup finished first.
    #[must_use]
    pub fn outranks(&self, other: &Self) -> bool {
        match self.confidence.total_cmp(&other.confidence) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.source < other.source,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn result(source: &str, confidence: f32, ttl_secs: u64) -> EnrichmentResult {
        EnrichmentResult {
            source: source.to_string(),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            fields: EnrichmentFields::new(),
            cache_key: "k".to_string(),
            ttl: Duration::from_secs(ttl_secs),
            confidence,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let r = result("domain", 0.3, 60);
        let fetched = r.fetched_at;
        assert!(!r.is_expired(fetched + chrono::Duration::seconds(59)));
        assert!(r.is_expired(fetched + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let r = result("domain", 0.3, u64::MAX);
        assert!(r.expires_at().is_none());
        assert!(!r.is_expired(Utc::now()));
    }

    #[test]
    fn test_outranks_by_confidence_then_name() {
        assert!(result("hunter", 0.7, 1).outranks(&result("domain", 0.3, 1)));
        assert!(!result("domain", 0.3, 1).outranks(&result("hunter", 0.7, 1)));
        assert!(result("a", 0.5, 1).outranks(&result("b", 0.5, 1)));
        assert!(!result("b", 0.5, 1).outranks(&result("a", 0.5, 1)));
    }

    #[test]
    fn test_ttl_serialized_as_seconds() {
        let json = serde_json::to_value(result("domain", 0.3, 3600)).unwrap();
        assert_eq!(json["ttl"], 3600);
    }
}
