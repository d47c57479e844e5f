//! Offline enrichment from the address domain alone.

use async_trait::async_trait;
use serde_json::Value;

use super::source::{EnrichmentSource, LookupError};
use crate::model::EnrichmentFields;

const PERSONAL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "proton.me",
    "protonmail.com",
    "gmx.com",
    "gmx.de",
    "web.de",
    "yandex.ru",
    "mail.ru",
];

const BIG_TECH_DOMAINS: &[&str] = &[
    "google.com",
    "apple.com",
    "microsoft.com",
    "amazon.com",
    "meta.com",
];

/// Second-level labels that sit under a country code, as in `co.uk`.
const GENERIC_SECOND_LEVEL: &[&str] = &["co", "com", "org", "net", "ac", "gov", "edu"];

const COUNTRY_TLDS: &[(&str, &str)] = &[
    ("uk", "GB"),
    ("de", "DE"),
    ("fr", "FR"),
    ("ca", "CA"),
    ("au", "AU"),
    ("nl", "NL"),
    ("es", "ES"),
    ("it", "IT"),
    ("se", "SE"),
    ("ch", "CH"),
    ("jp", "JP"),
    ("in", "IN"),
    ("br", "BR"),
    ("ie", "IE"),
    ("nz", "NZ"),
    ("pl", "PL"),
];

/// Classifies the domain and guesses the organization behind it.
///
/// Needs no network and never fails for an identity with a domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainInferenceSource;

impl DomainInferenceSource {
    /// Source name used in configuration and cache keys.
    pub const NAME: &'static str = "domain";

    /// Creates the source.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Fields inferred for `domain`.
    #[must_use]
    pub fn infer(domain: &str) -> EnrichmentFields {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        let category = classify(&domain);

        let mut fields = EnrichmentFields::new();
        fields.insert("domain_category".into(), Value::from(category));
        fields.insert(
            "email_type".into(),
            Value::from(if category == "personal" { "personal" } else { "work" }),
        );
        if category != "personal" {
            fields.insert("company_domain".into(), Value::from(domain.clone()));
            if let Some(company) = company_name(&domain) {
                fields.insert("inferred_company".into(), Value::from(company));
            }
        }
        if let Some(country) = country_code(&domain) {
            fields.insert("country_code".into(), Value::from(country));
        }
        fields
    }
}

#[async_trait]
impl EnrichmentSource for DomainInferenceSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn confidence(&self) -> f32 {
        0.3
    }

    async fn lookup(
        &self,
        email: &str,
        domain: Option<&str>,
    ) -> Result<EnrichmentFields, LookupError> {
        let domain = domain
            .or_else(|| email.rsplit_once('@').map(|(_, d)| d))
            .filter(|d| !d.is_empty())
            .ok_or(LookupError::NotFound)?;
        Ok(Self::infer(domain))
    }
}

fn classify(domain: &str) -> &'static str {
    let tld = domain.rsplit('.').next().unwrap_or(domain);
    if PERSONAL_DOMAINS.contains(&domain) {
        "personal"
    } else if BIG_TECH_DOMAINS
        .iter()
        .any(|d| domain == *d || domain.ends_with(&format!(".{d}")))
    {
        "big_tech"
    } else if tld == "edu" || domain.contains(".ac.") || domain.contains("university") {
        "academic"
    } else if tld == "gov" || domain.contains(".gov.") {
        "government"
    } else {
        "business"
    }
}

/// Organization label of the domain, capitalized: `mail.acme-corp.co.uk` gives `Acme Corp`.
fn company_name(domain: &str) -> Option<String> {
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }
    let mut index = labels.len() - 2;
    if index > 0 && labels[labels.len() - 1].len() == 2 && GENERIC_SECOND_LEVEL.contains(&labels[index]) {
        index -= 1;
    }
    let words: Vec<String> = labels[index]
        .split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

fn country_code(domain: &str) -> Option<&'static str> {
    let tld = domain.rsplit('.').next()?;
    COUNTRY_TLDS
        .iter()
        .find(|(suffix, _)| *suffix == tld)
        .map(|(_, code)| *code)
}
