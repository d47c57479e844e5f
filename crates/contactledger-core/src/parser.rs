//! Header parsing: turns one message into address observations.
//!
//! Parsing never fails on a single bad address. Every address that does not
//! become an observation is reported with a [`ReasonCode`] so the run summary
//! can account for it. A message is rejected as a whole only when it has no
//! usable timestamp.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use contactledger_mime::{AddressEntry, Headers, parse_address_list, parse_date, validate_address};

use crate::config::IgnoreRules;
use crate::model::{RawMessage, RawObservation, ReasonCode, Role};
use crate::normalize::Normalizer;

/// Observations extracted from one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Timestamp used for every observation.
    pub observed_at: DateTime<Utc>,
    /// One per distinct address (or bare name) across all roles.
    pub observations: Vec<RawObservation>,
    /// Entries that were dropped, with the reason.
    pub dropped: Vec<DroppedAddress>,
}

/// A header entry that did not become an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedAddress {
    /// Header the entry came from.
    pub role: Role,
    /// Entry as written.
    pub raw: String,
    /// Why it was dropped.
    pub reason: ReasonCode,
}

/// Parses message headers for one mailbox.
///
/// The owner's addresses are compared in canonical form, so tagged, dotted
/// or alias-domain spellings of them are excluded too.
#[derive(Debug, Clone)]
pub struct HeaderParser {
    own_addresses: BTreeSet<String>,
    ignore: IgnoreRules,
    normalizer: Normalizer,
}

impl HeaderParser {
    /// Creates a parser that excludes `own_address` and applies `ignore`.
    #[must_use]
    pub fn new(own_address: &str, ignore: IgnoreRules, normalizer: Normalizer) -> Self {
        Self {
            own_addresses: BTreeSet::new(),
            ignore,
            normalizer,
        }
        .with_own_address(own_address)
    }

    /// Adds another address of the mailbox owner.
    #[must_use]
    pub fn with_own_address(mut self, address: &str) -> Self {
        let own = self.own_key(address);
        if !own.is_empty() {
            self.own_addresses.insert(own);
        }
        self
    }

    fn own_key(&self, address: &str) -> String {
        self.normalizer
            .canonical_email(address)
            .unwrap_or_else(|| address.trim().to_lowercase())
    }

    /// Parses `message` received through `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`ReasonCode::MissingDate`] when neither the provider nor the
    /// `Date` header supplies a timestamp.
    pub fn parse(&self, provider: &str, message: &RawMessage) -> Result<ParsedMessage, ReasonCode> {
        let headers = &message.headers;
        let observed_at = message
            .internal_date
            .or_else(|| headers.get("Date").and_then(parse_date))
            .ok_or(ReasonCode::MissingDate)?;

        let lists = ListAddresses::from_headers(headers);
        let mut seen = HashSet::new();
        let mut parsed = ParsedMessage {
            observed_at,
            observations: Vec::new(),
            dropped: Vec::new(),
        };

        for role in Role::ALL {
            for entry in entries_for(headers, role) {
                match self.accept(&entry, &lists, &mut seen) {
                    Ok((raw_address, raw_display_name)) => {
                        parsed.observations.push(RawObservation {
                            source_provider: provider.to_string(),
                            source_message_id: message.id.clone(),
                            role,
                            raw_address,
                            raw_display_name,
                            observed_at,
                        });
                    }
                    Err(reason) => parsed.dropped.push(DroppedAddress {
                        role,
                        raw: entry.raw,
                        reason,
                    }),
                }
            }
        }

        Ok(parsed)
    }

    /// Decides whether an entry becomes an observation.
    fn accept(
        &self,
        entry: &AddressEntry,
        lists: &ListAddresses,
        seen: &mut HashSet<String>,
    ) -> Result<(Option<String>, Option<String>), ReasonCode> {
        let address = entry.address.as_deref().map(str::trim);
        // A display name that just repeats the address carries no information.
        let name = entry
            .display_name
            .clone()
            .filter(|name| address.is_none_or(|a| !name.eq_ignore_ascii_case(a)));

        let Some(address) = address else {
            let name = name.ok_or(ReasonCode::NoAddress)?;
            return remember(seen, format!("name:{}", name.to_lowercase()))
                .map(|()| (None, Some(name)));
        };

        let lowered = address.to_lowercase();
        if validate_address(&lowered).is_err() {
            let name = name.ok_or(ReasonCode::InvalidAddress)?;
            return remember(seen, format!("name:{}", name.to_lowercase()))
                .map(|()| (Some(address.to_string()), Some(name)));
        }
        if self.own_addresses.contains(&self.own_key(&lowered)) {
            return Err(ReasonCode::SelfAddress);
        }
        if self.ignore.matches(&lowered) {
            return Err(ReasonCode::Ignored);
        }
        if lists.contains(&lowered) {
            return Err(ReasonCode::MailingList);
        }
        remember(seen, lowered).map(|()| (Some(address.to_string()), name))
    }
}

fn remember(seen: &mut HashSet<String>, key: String) -> Result<(), ReasonCode> {
    if seen.insert(key) {
        Ok(())
    } else {
        Err(ReasonCode::Duplicate)
    }
}

/// Entries of one role. Only the first mailbox of the first `From` counts.
fn entries_for(headers: &Headers, role: Role) -> Vec<AddressEntry> {
    match role {
        Role::From => headers
            .get(role.header_name())
            .map(parse_address_list)
            .unwrap_or_default()
            .into_iter()
            .take(1)
            .collect(),
        Role::To | Role::Cc | Role::Bcc => headers
            .get_all(role.header_name())
            .into_iter()
            .flat_map(parse_address_list)
            .collect(),
    }
}

/// Addresses of the mailing list a message was distributed through.
struct ListAddresses {
    post: HashSet<String>,
    ids: HashSet<String>,
}

impl ListAddresses {
    fn from_headers(headers: &Headers) -> Self {
        let post = headers
            .get_all("List-Post")
            .into_iter()
            .flat_map(parse_address_list)
            .filter_map(|entry| entry.address)
            .map(|address| address.trim().to_lowercase())
            .collect();

        // List-Id: Dev List <dev.lists.example.org>
        let ids = headers
            .get_all("List-Id")
            .into_iter()
            .map(|value| {
                let inner = value
                    .split_once('<')
                    .and_then(|(_, rest)| rest.split_once('>'))
                    .map_or(value, |(id, _)| id);
                inner.trim().to_lowercase()
            })
            .filter(|id| !id.is_empty())
            .collect();

        Self { post, ids }
    }

    fn contains(&self, address: &str) -> bool {
        self.post.contains(address) || self.ids.contains(&address.replacen('@', ".", 1))
    }
}
