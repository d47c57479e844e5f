//! Merge engine: folds observations into deduplicated contacts.
//!
//! The result depends only on the multiset of observations, never on their
//! arrival order. Email-keyed observations merge immediately. Name-only
//! observations are held back until every observation has arrived, then
//! attached to the single email contact with the same canonical name (and
//! domain, when one was inferred) or grouped into low-confidence contacts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{Contact, ContactId, Provenance, RawObservation, RoleCounts};
use crate::normalize::{IdentityKey, NormalizedIdentity, Normalizer, canonical_name};

/// Contact plus the bookkeeping needed to pick its display name.
#[derive(Debug)]
struct Slot {
    contact: Contact,
    /// Timestamp of the observation the display name came from.
    name_seen_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn new(key: &str, identity: &NormalizedIdentity, observed_at: DateTime<Utc>) -> Self {
        Self {
            contact: Contact {
                id: ContactId::from_key(key),
                canonical_email: identity.canonical_email.clone(),
                canonical_name: String::new(),
                display_name: String::new(),
                domain: identity.canonical_domain.clone(),
                low_confidence: identity.is_low_confidence(),
                provenance: BTreeSet::new(),
                first_seen: observed_at,
                last_seen: observed_at,
                role_counts: RoleCounts::default(),
                account_stats: BTreeMap::new(),
                relationship_strength: 0.0,
                enrichment: None,
                enrichment_status: BTreeMap::new(),
            },
            name_seen_at: None,
        }
    }

    fn absorb(&mut self, observation: &RawObservation) {
        let contact = &mut self.contact;
        contact.provenance.insert(Provenance {
            provider: observation.source_provider.clone(),
            message_id: observation.source_message_id.clone(),
        });
        contact.role_counts.record(observation.role);
        contact
            .account_stats
            .entry(observation.source_provider.clone())
            .or_default()
            .record(observation.role);
        contact.first_seen = contact.first_seen.min(observation.observed_at);
        contact.last_seen = contact.last_seen.max(observation.observed_at);

        if let Some(name) = observation.raw_display_name.as_deref() {
            self.consider_name(name, observation.observed_at);
        }
    }

    /// Keeps the most recently observed name; equal timestamps pick the
    /// lexicographically smallest so the choice is order-independent.
    fn consider_name(&mut self, name: &str, observed_at: DateTime<Utc>) {
        let name = name.trim();
        if name.is_empty() || canonical_name(name).is_empty() {
            return;
        }
        if let Some(email) = &self.contact.canonical_email
            && name.eq_ignore_ascii_case(email)
        {
            return;
        }

        let replace = match self.name_seen_at {
            None => true,
            Some(previous) => {
                observed_at > previous
                    || (observed_at == previous && name < self.contact.display_name.as_str())
            }
        };
        if replace {
            self.contact.display_name = name.to_string();
            self.contact.canonical_name = canonical_name(name);
            self.name_seen_at = Some(observed_at);
        }
    }
}

/// Incremental merge of observations into contacts.
#[derive(Debug, Default)]
pub struct MergeEngine {
    normalizer: Normalizer,
    contacts: HashMap<String, Slot>,
    name_only: Vec<(NormalizedIdentity, RawObservation)>,
    accepted: usize,
    rejected: usize,
}

impl MergeEngine {
    /// Creates an engine using `normalizer` for identities.
    #[must_use]
    pub fn new(normalizer: Normalizer) -> Self {
        Self {
            normalizer,
            ..Self::default()
        }
    }

    /// Folds one observation in. Returns false if it carried no usable identity.
    pub fn observe(&mut self, observation: RawObservation) -> bool {
        let Some(identity) = self.normalizer.normalize(&observation) else {
            debug!(
                provider = %observation.source_provider,
                message = %observation.source_message_id,
                "observation has no usable identity"
            );
            self.rejected += 1;
            return false;
        };
        self.accepted += 1;

        match identity.key() {
            IdentityKey::Email(key) => {
                self.contacts
                    .entry(key)
                    .or_insert_with_key(|key| Slot::new(key, &identity, observation.observed_at))
                    .absorb(&observation);
            }
            IdentityKey::Name { .. } => self.name_only.push((identity, observation)),
        }
        true
    }

    /// Observations folded in so far.
    #[must_use]
    pub const fn accepted(&self) -> usize {
        self.accepted
    }

    /// Observations dropped for lack of a usable identity.
    #[must_use]
    pub const fn rejected(&self) -> usize {
        self.rejected
    }

    /// Resolves name-only observations and returns the contacts.
    ///
    /// Contacts are ordered by `first_seen`, then merge key.
    #[must_use]
    pub fn finish(mut self) -> Vec<Contact> {
        let mut by_name: HashMap<&str, Vec<String>> = HashMap::new();
        for (key, slot) in &self.contacts {
            if !slot.contact.canonical_name.is_empty() {
                by_name
                    .entry(slot.contact.canonical_name.as_str())
                    .or_default()
                    .push(key.clone());
            }
        }

        let mut attachments = Vec::new();
        let mut orphans = Vec::new();
        for (identity, observation) in std::mem::take(&mut self.name_only) {
            let candidates: Vec<&String> = by_name
                .get(identity.canonical_name.as_str())
                .map(|keys| {
                    keys.iter()
                        .filter(|key| {
                            identity.canonical_domain.is_none()
                                || self.contacts[key.as_str()].contact.domain
                                    == identity.canonical_domain
                        })
                        .collect()
                })
                .unwrap_or_default();

            match candidates.as_slice() {
                [only] => attachments.push(((*only).clone(), observation)),
                _ => orphans.push((identity, observation)),
            }
        }
        drop(by_name);

        for (key, observation) in attachments {
            if let Some(slot) = self.contacts.get_mut(&key) {
                slot.absorb(&observation);
            }
        }

        for (identity, observation) in orphans {
            let key = identity.key().to_string();
            self.contacts
                .entry(key)
                .or_insert_with_key(|key| Slot::new(key, &identity, observation.observed_at))
                .absorb(&observation);
        }

        let mut contacts: Vec<(String, Contact)> = self
            .contacts
            .into_iter()
            .map(|(key, slot)| (key, slot.contact))
            .collect();
        contacts.sort_by(|(ka, a), (kb, b)| a.first_seen.cmp(&b.first_seen).then_with(|| ka.cmp(kb)));
        contacts.into_iter().map(|(_, contact)| contact).collect()
    }
}

/// Merges a batch of observations in one call.
#[must_use]
pub fn merge_all(
    normalizer: Normalizer,
    observations: impl IntoIterator<Item = RawObservation>,
) -> Vec<Contact> {
    let mut engine = MergeEngine::new(normalizer);
    for observation in observations {
        engine.observe(observation);
    }
    engine.finish()
}
