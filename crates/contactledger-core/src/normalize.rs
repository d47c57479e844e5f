//! Identity normalization.
//!
//! Turns a raw observation into the canonical identity the merge engine keys
//! on. Rules run in a fixed order:
//!
//! 1. lowercase and trim
//! 2. strip a subaddress tag (`+tag`) unless the domain is exempt
//! 3. fold alias domains onto their canonical domain, then drop dots from the
//!    local part where the canonical domain ignores them
//!
//! Observations without a valid address but with a usable display name become
//! low-confidence identities keyed by name (and domain, when one can be
//! inferred).

use contactledger_mime::validate_address;

use crate::config::NormalizeConfig;
use crate::model::RawObservation;

/// Canonical identity of one observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedIdentity {
    /// Canonical address; `None` for name-only identities.
    pub canonical_email: Option<String>,
    /// Tokenized lowercase display name; empty when none was seen.
    pub canonical_name: String,
    /// Canonical domain, if known.
    pub canonical_domain: Option<String>,
}

/// Key an identity is merged under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKey {
    /// Keyed by canonical address.
    Email(String),
    /// Keyed by canonical name plus optional domain.
    Name {
        /// Canonical name.
        name: String,
        /// Inferred domain.
        domain: Option<String>,
    },
}

impl NormalizedIdentity {
    /// Returns true when the identity rests on a display name only.
    #[must_use]
    pub const fn is_low_confidence(&self) -> bool {
        self.canonical_email.is_none()
    }

    /// Merge key of this identity.
    #[must_use]
    pub fn key(&self) -> IdentityKey {
        match &self.canonical_email {
            Some(email) => IdentityKey::Email(email.clone()),
            None => IdentityKey::Name {
                name: self.canonical_name.clone(),
                domain: self.canonical_domain.clone(),
            },
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email(email) => f.write_str(email),
            Self::Name { name, domain } => {
                f.write_str(&crate::model::name_key(name, domain.as_deref()))
            }
        }
    }
}

/// Applies [`NormalizeConfig`] rules to observations.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizeConfig,
}

impl Normalizer {
    /// Creates a normalizer with the given rules.
    #[must_use]
    pub const fn new(config: NormalizeConfig) -> Self {
        Self { config }
    }

    /// Normalizes an observation.
    ///
    /// Returns `None` when the observation has neither a valid address nor a
    /// usable display name.
    #[must_use]
    pub fn normalize(&self, observation: &RawObservation) -> Option<NormalizedIdentity> {
        let canonical_name = observation
            .raw_display_name
            .as_deref()
            .map(canonical_name)
            .unwrap_or_default();

        if let Some(email) = observation
            .raw_address
            .as_deref()
            .and_then(|address| self.canonical_email(address))
        {
            let canonical_domain = email.rsplit_once('@').map(|(_, domain)| domain.to_string());
            return Some(NormalizedIdentity {
                canonical_email: Some(email),
                canonical_name,
                canonical_domain,
            });
        }

        if canonical_name.is_empty() {
            return None;
        }

        let canonical_domain = observation
            .raw_address
            .as_deref()
            .and_then(|address| self.infer_domain(address));
        Some(NormalizedIdentity {
            canonical_email: None,
            canonical_name,
            canonical_domain,
        })
    }

    /// Canonical form of an address, or `None` if it is not a valid address.
    #[must_use]
    pub fn canonical_email(&self, address: &str) -> Option<String> {
        let lowered = address.trim().to_lowercase();
        validate_address(&lowered).ok()?;
        let (local, domain) = lowered.rsplit_once('@')?;

        let mut local = local.to_string();
        if !self.config.subaddress_exempt_domains.contains(domain)
            && let Some(cut) = local.find(self.config.subaddress_separators.as_slice())
            && cut > 0
        {
            local.truncate(cut);
        }

        let domain = self.canonical_domain(domain);
        if self.config.dot_insensitive_domains.contains(&domain) {
            let dotless: String = local.chars().filter(|c| *c != '.').collect();
            if !dotless.is_empty() {
                local = dotless;
            }
        }

        Some(format!("{local}@{domain}"))
    }

    /// Canonical form of a lowercase domain.
    #[must_use]
    pub fn canonical_domain(&self, domain: &str) -> String {
        self.config
            .alias_domains
            .get(domain)
            .cloned()
            .unwrap_or_else(|| domain.to_string())
    }

    /// Domain of something that failed address validation but still names a host.
    fn infer_domain(&self, raw: &str) -> Option<String> {
        let (_, host) = raw.trim().rsplit_once('@')?;
        let host = host
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        let labels: Vec<&str> = host.split('.').collect();
        let plausible = labels.len() >= 2
            && labels.iter().all(|label| {
                !label.is_empty() && label.chars().all(|c| c.is_alphanumeric() || c == '-')
            });
        plausible.then(|| self.canonical_domain(&host))
    }
}

/// Tokenized lowercase form of a display name.
///
/// Punctuation separates tokens and is dropped: `"Smith, Bob J."` becomes
/// `"smith bob j"`.
#[must_use]
pub fn canonical_name(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Role;
    use chrono::Utc;

    fn observation(address: Option<&str>, name: Option<&str>) -> RawObservation {
        RawObservation {
            source_provider: "work".to_string(),
            source_message_id: "m1".to_string(),
            role: Role::From,
            raw_address: address.map(ToString::to_string),
            raw_display_name: name.map(ToString::to_string),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_lowercase_and_trim() {
        let n = Normalizer::default();
        assert_eq!(n.canonical_email("  Bob@Corp.COM "), Some("bob@corp.com".to_string()));
    }

    #[test]
    fn test_subaddress_stripped() {
        let n = Normalizer::default();
        assert_eq!(
            n.canonical_email("alice+news@example.com"),
            Some("alice@example.com".to_string())
        );
    }

    #[test]
    fn test_subaddress_exempt_domain() {
        let mut config = NormalizeConfig::default();
        config.subaddress_exempt_domains.insert("tagged.org".to_string());
        let n = Normalizer::new(config);
        assert_eq!(
            n.canonical_email("alice+news@tagged.org"),
            Some("alice+news@tagged.org".to_string())
        );
    }

    #[test]
    fn test_leading_separator_kept() {
        let n = Normalizer::default();
        assert_eq!(n.canonical_email("+1@example.com"), Some("+1@example.com".to_string()));
    }

    #[test]
    fn test_alias_domain_and_dots() {
        let n = Normalizer::default();
        assert_eq!(
            n.canonical_email("J.Doe+shopping@googlemail.com"),
            Some("jdoe@gmail.com".to_string())
        );
        assert_eq!(
            n.canonical_email("j.doe@corp.com"),
            Some("j.doe@corp.com".to_string())
        );
    }

    #[test]
    fn test_invalid_address_rejected() {
        let n = Normalizer::default();
        assert!(n.canonical_email("not-an-address").is_none());
        assert!(n.canonical_email("a@b").is_none());
    }

    #[test]
    fn test_normalize_email_identity() {
        let n = Normalizer::default();
        let id = n
            .normalize(&observation(Some("Alice+a@Example.com"), Some("Alice Smith")))
            .unwrap();
        assert_eq!(id.canonical_email.as_deref(), Some("alice@example.com"));
        assert_eq!(id.canonical_name, "alice smith");
        assert_eq!(id.canonical_domain.as_deref(), Some("example.com"));
        assert!(!id.is_low_confidence());
        assert_eq!(id.key(), IdentityKey::Email("alice@example.com".to_string()));
    }

    #[test]
    fn test_normalize_name_only() {
        let n = Normalizer::default();
        let id = n.normalize(&observation(None, Some("Jane  ROE"))).unwrap();
        assert!(id.is_low_confidence());
        assert_eq!(
            id.key(),
            IdentityKey::Name {
                name: "jane roe".to_string(),
                domain: None
            }
        );
    }

    #[test]
    fn test_normalize_name_with_inferred_domain() {
        let n = Normalizer::default();
        let id = n
            .normalize(&observation(Some("jane@@Corp.com"), Some("Jane Roe")))
            .unwrap();
        assert!(id.is_low_confidence());
        assert_eq!(id.canonical_domain.as_deref(), Some("corp.com"));
        assert_eq!(id.key().to_string(), "name:jane roe@corp.com");
    }

    #[test]
    fn test_normalize_nothing_usable() {
        let n = Normalizer::default();
        assert!(n.normalize(&observation(Some("garbage"), None)).is_none());
        assert!(n.normalize(&observation(None, Some("!!!"))).is_none());
    }

    #[test]
    fn test_canonical_name_tokens() {
        assert_eq!(canonical_name("Smith, Bob J."), "smith bob j");
        assert_eq!(canonical_name("  José   García "), "josé garcía");
        assert_eq!(canonical_name(""), "");
    }
}
