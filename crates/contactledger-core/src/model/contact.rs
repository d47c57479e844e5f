//! Merged contact model.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{EnrichmentResult, ReasonCode, Role};

/// Stable contact identifier derived from the merge key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub String);

impl ContactId {
    /// Derives the id from a merge key: the first 8 bytes of its SHA-256, hex encoded.
    #[must_use]
    pub fn from_key(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self(digest.iter().take(8).map(|b| format!("{b:02x}")).collect())
    }
}

impl std::fmt::Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message a contact was seen in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Provenance {
    /// Provider name.
    pub provider: String,
    /// Provider-scoped message id.
    pub message_id: String,
}

/// Number of observations per header role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    /// Seen as sender.
    pub from: u32,
    /// Seen as direct recipient.
    pub to: u32,
    /// Seen in copy.
    pub cc: u32,
    /// Seen in blind copy.
    pub bcc: u32,
}

impl RoleCounts {
    /// Counts one observation in `role`.
    pub const fn record(&mut self, role: Role) {
        let slot = match role {
            Role::From => &mut self.from,
            Role::To => &mut self.to,
            Role::Cc => &mut self.cc,
            Role::Bcc => &mut self.bcc,
        };
        *slot = slot.saturating_add(1);
    }

    /// Total observations across roles.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.from as u64 + self.to as u64 + self.cc as u64 + self.bcc as u64
    }

    /// Messages the contact sent to the mailbox owner.
    #[must_use]
    pub const fn received(&self) -> u64 {
        self.from as u64
    }

    /// Messages the contact was addressed in.
    #[must_use]
    pub const fn sent(&self) -> u64 {
        self.to as u64 + self.cc as u64 + self.bcc as u64
    }

    /// Heuristic relationship strength in `[0, 1]` for a contact last seen
    /// `days_since_last` days ago.
    ///
    /// Volume contributes up to 0.4 (saturating at 10 messages), a balanced
    /// exchange up to 0.3 and recency between 0.05 and 0.2.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn strength(&self, days_since_last: i64) -> f64 {
        let frequency = self.total();
        if frequency == 0 {
            return 0.0;
        }
        let base = (frequency as f64 / 25.0).min(0.4);

        let (sent, received) = (self.sent(), self.received());
        let balance = if sent > 0 && received > 0 {
            sent.min(received) as f64 / sent.max(received) as f64 * 0.3
        } else {
            0.0
        };

        let recency = match days_since_last {
            ..=7 => 0.2,
            8..=30 => 0.15,
            31..=90 => 0.1,
            _ => 0.05,
        };

        (base + balance + recency).min(1.0)
    }
}

/// Terminal enrichment state of a contact for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// Source answered and the result was stored.
    Enriched,
    /// Fresh cached result was used; no call was made.
    CacheHit,
    /// Lookup failed; other sources and contacts are unaffected.
    Failed {
        /// Failure class.
        reason: ReasonCode,
        /// Human-readable detail.
        detail: String,
    },
    /// Lookup was not attempted.
    Skipped {
        /// Why.
        reason: ReasonCode,
    },
}

/// A deduplicated person, built by the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Stable id derived from the merge key.
    pub id: ContactId,
    /// Canonical email; absent for low-confidence name-only contacts.
    pub canonical_email: Option<String>,
    /// Tokenized lowercase form of the best display name.
    pub canonical_name: String,
    /// Best observed display name, empty when none was seen.
    pub display_name: String,
    /// Canonical domain, if known.
    pub domain: Option<String>,
    /// True when the identity rests on a display name only.
    pub low_confidence: bool,
    /// Every message this contact was observed in.
    pub provenance: BTreeSet<Provenance>,
    /// Earliest observation.
    pub first_seen: DateTime<Utc>,
    /// Latest observation.
    pub last_seen: DateTime<Utc>,
    /// Observations per role.
    pub role_counts: RoleCounts,
    /// Observations per role, per provider.
    #[serde(default)]
    pub account_stats: BTreeMap<String, RoleCounts>,
    /// Strength scored at the end of the run; see [`RoleCounts::strength`].
    #[serde(default)]
    pub relationship_strength: f64,
    /// Best enrichment result attached so far.
    pub enrichment: Option<EnrichmentResult>,
    /// Per-source enrichment state.
    pub enrichment_status: BTreeMap<String, EnrichmentStatus>,
}

impl Contact {
    /// Key the merge engine groups observations under.
    #[must_use]
    pub fn merge_key(&self) -> String {
        match &self.canonical_email {
            Some(email) => email.clone(),
            None => name_key(&self.canonical_name, self.domain.as_deref()),
        }
    }

    /// Relationship strength across every provider, as of `now`.
    #[must_use]
    pub fn relationship_strength(&self, now: DateTime<Utc>) -> f64 {
        self.role_counts.strength(self.days_since_last(now))
    }

    /// Relationship strength as seen from one provider; 0 if it never saw the contact.
    #[must_use]
    pub fn relationship_strength_for(&self, provider: &str, now: DateTime<Utc>) -> f64 {
        self.account_stats
            .get(provider)
            .map_or(0.0, |counts| counts.strength(self.days_since_last(now)))
    }

    /// Stores [`Self::relationship_strength`] as of `now`.
    pub fn rescore(&mut self, now: DateTime<Utc>) {
        self.relationship_strength = self.relationship_strength(now);
    }

    fn days_since_last(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen).num_days()
    }

    /// Returns "Name <email>" when both are known, otherwise whichever exists.
    #[must_use]
    pub fn display(&self) -> String {
        match (&self.canonical_email, self.display_name.is_empty()) {
            (Some(email), true) => email.clone(),
            (Some(email), false) => format!("{} <{email}>", self.display_name),
            (None, _) => self.display_name.clone(),
        }
    }

    /// Attaches an enrichment result unless it would downgrade what is there.
    ///
    /// A stale result is never attached. A fresh result replaces the current
    /// one when the current one has expired or ranks lower. Returns whether the
    /// result was attached.
    pub fn attach_enrichment(&mut self, result: EnrichmentResult, now: DateTime<Utc>) -> bool {
        if result.is_expired(now) {
            return false;
        }
        let replace = self
            .enrichment
            .as_ref()
            .is_none_or(|current| current.is_expired(now) || result.outranks(current));
        if replace {
            self.enrichment = Some(result);
        }
        replace
    }
}

/// Merge key of a name-only identity.
pub(crate) fn name_key(canonical_name: &str, domain: Option<&str>) -> String {
    match domain {
        Some(domain) => format!("name:{canonical_name}@{domain}"),
        None => format!("name:{canonical_name}"),
    }
}
