//! End-to-end runs over in-memory providers and enrichment sources.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use contactledger_core::enrich::{EnrichmentCache, EnrichmentSource, LookupError, SqliteCache};
use contactledger_core::model::EnrichmentFields;
use contactledger_core::pipeline::{ProviderStatus, RunOutput, RunStatus};
use contactledger_core::provider::{
    AccessToken, DateRange, GmailAdapter, GmailApi, GmailHeader, GmailListPage, GmailMessage,
    GmailMessageRef, GmailPayload, GraphAdapter, GraphApi, GraphEmailAddress, GraphMessage,
    GraphPage, GraphRecipient, ImapAdapter, ImapHeaderBlock, ImapSession, MissingToken,
    ProviderError, ProviderKind, StaticToken, TokenSource,
};
use contactledger_core::{
    EnrichmentStatus, Pipeline, RateLimitConfig, ReasonCode, RetryPolicy, RunConfig,
};
use tokio_util::sync::CancellationToken;

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

fn march() -> DateRange {
    DateRange {
        since: at("2026-03-01T00:00:00Z"),
        until: at("2026-04-01T00:00:00Z"),
    }
}

fn config() -> RunConfig {
    RunConfig {
        retry: RetryPolicy::immediate(3),
        ..RunConfig::default()
    }
}

fn token() -> Arc<dyn TokenSource> {
    Arc::new(StaticToken(AccessToken::new("token")))
}

fn gmail_message(id: &str, sent: &str, headers: &[(&str, &str)]) -> GmailMessage {
    GmailMessage {
        id: id.to_string(),
        internal_date: Some(at(sent).timestamp_millis().to_string()),
        snippet: None,
        payload: Some(GmailPayload {
            headers: headers
                .iter()
                .map(|(name, value)| GmailHeader {
                    name: (*name).to_string(),
                    value: (*value).to_string(),
                })
                .collect(),
        }),
    }
}

/// Single-page mailbox.
struct Mailbox(Vec<GmailMessage>);

#[async_trait]
impl GmailApi for Mailbox {
    async fn list_message_ids(
        &self,
        _token: &str,
        _query: &str,
        _page_token: Option<&str>,
    ) -> Result<GmailListPage, ProviderError> {
        Ok(GmailListPage {
            messages: self
                .0
                .iter()
                .map(|m| GmailMessageRef { id: m.id.clone() })
                .collect(),
            next_page_token: None,
        })
    }

    async fn get_message(&self, _token: &str, id: &str) -> Result<GmailMessage, ProviderError> {
        self.0
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| ProviderError::Malformed {
                id: id.to_string(),
                reason: "unknown id".to_string(),
            })
    }
}

/// Mailbox whose listing still names messages that were deleted since.
struct Pruned {
    listed: Vec<&'static str>,
    kept: Vec<GmailMessage>,
}

#[async_trait]
impl GmailApi for Pruned {
    async fn list_message_ids(
        &self,
        _token: &str,
        _query: &str,
        _page_token: Option<&str>,
    ) -> Result<GmailListPage, ProviderError> {
        Ok(GmailListPage {
            messages: self
                .listed
                .iter()
                .map(|id| GmailMessageRef { id: (*id).to_string() })
                .collect(),
            next_page_token: None,
        })
    }

    async fn get_message(&self, _token: &str, id: &str) -> Result<GmailMessage, ProviderError> {
        self.kept
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| ProviderError::from_status(404, None, "Requested entity was not found."))
    }
}

/// Mailbox whose listing never answers.
struct Stalled;

#[async_trait]
impl GmailApi for Stalled {
    async fn list_message_ids(
        &self,
        _token: &str,
        _query: &str,
        _page_token: Option<&str>,
    ) -> Result<GmailListPage, ProviderError> {
        std::future::pending().await
    }

    async fn get_message(&self, _token: &str, _id: &str) -> Result<GmailMessage, ProviderError> {
        std::future::pending().await
    }
}

fn gmail(name: &str, account: &str, messages: Vec<GmailMessage>) -> GmailAdapter {
    GmailAdapter::new(name, account, Box::new(Mailbox(messages)), token())
}

struct Delta(Vec<GraphMessage>);

#[async_trait]
impl GraphApi for Delta {
    async fn delta_page(
        &self,
        _token: &str,
        _since: DateTime<Utc>,
        _next_link: Option<&str>,
    ) -> Result<GraphPage, ProviderError> {
        Ok(GraphPage {
            value: self.0.clone(),
            next_link: None,
            delta_link: Some("delta".to_string()),
        })
    }
}

fn recipient(name: Option<&str>, address: &str) -> GraphRecipient {
    GraphRecipient {
        email_address: Some(GraphEmailAddress {
            name: name.map(ToString::to_string),
            address: Some(address.to_string()),
        }),
    }
}

struct OneMessageImap(String);

#[async_trait]
impl ImapSession for OneMessageImap {
    async fn login(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn uid_search(
        &mut self,
        _since: NaiveDate,
        _before: NaiveDate,
    ) -> Result<Vec<u32>, ProviderError> {
        Ok(vec![7])
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<ImapHeaderBlock>, ProviderError> {
        Ok(uids
            .iter()
            .map(|&uid| ImapHeaderBlock {
                uid,
                internal_date: None,
                header: self.0.clone(),
            })
            .collect())
    }
}

/// Source that records when each call was made.
#[derive(Default)]
struct CountingSource {
    calls: Mutex<Vec<tokio::time::Instant>>,
}

impl CountingSource {
    fn calls(&self) -> Vec<tokio::time::Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnrichmentSource for CountingSource {
    fn name(&self) -> &str {
        "counting"
    }

    fn confidence(&self) -> f32 {
        0.6
    }

    async fn lookup(
        &self,
        email: &str,
        domain: Option<&str>,
    ) -> Result<EnrichmentFields, LookupError> {
        self.calls.lock().unwrap().push(tokio::time::Instant::now());
        Ok(EnrichmentFields::from([
            ("email".to_string(), email.into()),
            ("domain".to_string(), domain.unwrap_or_default().into()),
        ]))
    }
}

fn emails(output: &RunOutput) -> Vec<&str> {
    output
        .contacts
        .iter()
        .filter_map(|c| c.canonical_email.as_deref())
        .collect()
}

#[tokio::test]
async fn test_same_person_across_two_providers() {
    let a = gmail(
        "a",
        "me@a.com",
        vec![gmail_message(
            "m1",
            "2026-03-03T10:00:00Z",
            &[("From", "Bob <bob@corp.com>"), ("To", "me@a.com")],
        )],
    );
    let b = GraphAdapter::new(
        "b",
        "me@b.com",
        Box::new(Delta(vec![GraphMessage {
            id: "g1".to_string(),
            received_date_time: Some("2026-03-04T09:00:00Z".to_string()),
            from: Some(recipient(None, "me@b.com")),
            to_recipients: vec![recipient(None, "Bob@Corp.com")],
            ..GraphMessage::default()
        }])),
        token(),
    );

    let output = Pipeline::new(config())
        .with_adapter(a)
        .with_adapter(b)
        .with_range(march())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.contacts.len(), 1);
    let bob = &output.contacts[0];
    assert_eq!(bob.canonical_email.as_deref(), Some("bob@corp.com"));
    assert_eq!(bob.provenance.len(), 2);
    assert_eq!((bob.role_counts.from, bob.role_counts.to), (1, 1));
    assert_eq!(bob.role_counts.total(), 2);
    assert_eq!(bob.display_name, "Bob");
    let accounts: Vec<&str> = bob.account_stats.keys().map(String::as_str).collect();
    assert_eq!(accounts, vec!["a", "b"]);
    // Balanced exchange of two messages, scored well after March.
    assert!((0.43..=0.58).contains(&bob.relationship_strength));
    let json = serde_json::to_value(&output).unwrap();
    assert_eq!(json["contacts"][0]["relationship_strength"], bob.relationship_strength);
    assert_eq!(output.summary.status, RunStatus::Success);
    assert_eq!(output.summary.providers["b"].dropped[&ReasonCode::SelfAddress], 1);
}

#[tokio::test]
async fn test_subaddress_merges_with_latest_name() {
    let a = gmail(
        "a",
        "me@a.com",
        vec![
            gmail_message("m2", "2026-03-05T10:00:00Z", &[("From", "\"A. Smith\" <Alice+tag@x.com>")]),
            gmail_message("m1", "2026-03-02T10:00:00Z", &[("From", "Alice <alice@x.com>")]),
        ],
    );

    let output = Pipeline::new(config())
        .with_adapter(a)
        .with_range(march())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(emails(&output), vec!["alice@x.com"]);
    let alice = &output.contacts[0];
    assert_eq!(alice.display_name, "A. Smith");
    assert_eq!(alice.first_seen, at("2026-03-02T10:00:00Z"));
    assert_eq!(alice.last_seen, at("2026-03-05T10:00:00Z"));
}

#[tokio::test]
async fn test_failed_provider_is_isolated() {
    let a = gmail(
        "a",
        "me@a.com",
        vec![gmail_message("m1", "2026-03-03T10:00:00Z", &[("From", "carol@a-corp.com")])],
    );
    let b = GmailAdapter::new(
        "b",
        "me@b.com",
        Box::new(Mailbox(vec![gmail_message(
            "m9",
            "2026-03-03T10:00:00Z",
            &[("From", "only-in-b@b-corp.com")],
        )])),
        Arc::new(MissingToken("no token stored".to_string())),
    );
    let c = ImapAdapter::new(
        "c",
        "me@c.com",
        Box::new(OneMessageImap(
            "From: Dave <dave@c-corp.com>\r\nTo: me@c.com, Carol <CAROL@a-corp.com>\r\nDate: Wed, 4 Mar 2026 10:00:00 +0000\r\n"
                .to_string(),
        )),
    );

    let output = Pipeline::new(config())
        .with_adapter(a)
        .with_adapter(b)
        .with_adapter(c)
        .with_range(march())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(emails(&output), vec!["carol@a-corp.com", "dave@c-corp.com"]);
    let carol = &output.contacts[0];
    let providers: BTreeSet<&str> = carol.provenance.iter().map(|p| p.provider.as_str()).collect();
    assert_eq!(providers, BTreeSet::from(["a", "c"]));

    let configured = BTreeSet::from(["a", "b", "c"]);
    for contact in &output.contacts {
        assert!(!contact.provenance.is_empty());
        assert!(
            contact
                .provenance
                .iter()
                .all(|p| configured.contains(p.provider.as_str()))
        );
    }

    let summary = &output.summary;
    assert_eq!(summary.status, RunStatus::Degraded);
    let b = &summary.providers["b"];
    assert_eq!(b.status, ProviderStatus::Failed);
    assert!(!b.authenticated);
    assert_eq!(b.failure.as_ref().unwrap().reason, ReasonCode::AuthFailed);
    assert_eq!(summary.providers["a"].status, ProviderStatus::Completed);
    assert_eq!(summary.providers["c"].messages, 1);

    let json = serde_json::to_value(&output).unwrap();
    assert_eq!(json["summary"]["status"], "degraded");
    assert_eq!(json["summary"]["providers"]["b"]["failure"]["reason"], "auth_failed");
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_keeps_merged_contacts() {
    let a = gmail(
        "a",
        "me@a.com",
        vec![gmail_message("m1", "2026-03-03T10:00:00Z", &[("From", "erin@corp.com")])],
    );
    let b = GmailAdapter::new("b", "me@b.com", Box::new(Stalled), token());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let output = Pipeline::new(config())
        .with_adapter(a)
        .with_adapter(b)
        .with_range(march())
        .run(&cancel)
        .await
        .unwrap();

    assert_eq!(emails(&output), vec!["erin@corp.com"]);
    assert!(output.summary.cancelled);
    assert_eq!(output.summary.providers["b"].status, ProviderStatus::Cancelled);
    assert_eq!(output.summary.status, RunStatus::Degraded);
}

#[tokio::test]
async fn test_cached_enrichment_skips_the_network() {
    let cache: Arc<dyn EnrichmentCache> = Arc::new(SqliteCache::in_memory().await.unwrap());
    let source = Arc::new(CountingSource::default());
    let cancel = CancellationToken::new();
    let run = || {
        let a = gmail(
            "a",
            "me@a.com",
            vec![gmail_message("m1", "2026-03-03T10:00:00Z", &[("From", "Fay <fay@corp.com>")])],
        );
        Pipeline::new(RunConfig {
            enrich: true,
            ..config()
        })
        .with_adapter(a)
        .with_enrichment(
            vec![Arc::clone(&source) as Arc<dyn EnrichmentSource>],
            Arc::clone(&cache),
        )
        .with_range(march())
        .run(&cancel)
    };

    let first = run().await.unwrap();
    assert_eq!(source.calls().len(), 1);
    assert_eq!(first.summary.sources["counting"].succeeded, 1);

    let second = run().await.unwrap();
    assert_eq!(source.calls().len(), 1);
    assert_eq!(second.summary.sources["counting"].cache_hits, 1);
    assert_eq!(second.contacts[0].enrichment, first.contacts[0].enrichment);
    assert_eq!(
        second.contacts[0].enrichment_status["counting"],
        EnrichmentStatus::CacheHit
    );
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_holds_in_every_window() {
    let recipients: Vec<String> = (0..12).map(|i| format!("user{i}@corp.com")).collect();
    let to = recipients.join(", ");
    let a = gmail(
        "a",
        "me@a.com",
        vec![gmail_message("m1", "2026-03-03T10:00:00Z", &[("From", "me@a.com"), ("To", &to)])],
    );
    let source = Arc::new(CountingSource::default());
    let window = Duration::from_secs(1);
    let config = RunConfig {
        enrich: true,
        workers: 8,
        rate_limits: BTreeMap::from([(
            "counting".to_string(),
            RateLimitConfig { limit: 3, window },
        )]),
        ..config()
    };

    let output = Pipeline::new(config)
        .with_adapter(a)
        .with_enrichment(
            vec![Arc::clone(&source) as Arc<dyn EnrichmentSource>],
            Arc::new(contactledger_core::MemoryCache::new()),
        )
        .with_range(march())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.summary.sources["counting"].succeeded, 12);
    let mut calls = source.calls();
    calls.sort();
    assert_eq!(calls.len(), 12);
    for (i, start) in calls.iter().enumerate() {
        let in_window = calls[i..]
            .iter()
            .take_while(|t| t.duration_since(*start) < window)
            .count();
        assert!(in_window <= 3, "{in_window} calls admitted within one window");
    }
}

#[tokio::test]
async fn test_message_cap_per_provider() {
    let messages = (0..5)
        .map(|i| {
            gmail_message(
                &format!("m{i}"),
                "2026-03-03T10:00:00Z",
                &[("From", &format!("sender{i}@corp.com"))],
            )
        })
        .collect();
    let output = Pipeline::new(RunConfig {
        max_messages_per_provider: Some(2),
        ..config()
    })
    .with_adapter(gmail("a", "me@a.com", messages))
    .with_range(march())
    .run(&CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(output.contacts.len(), 2);
    assert_eq!(output.summary.providers["a"].messages, 2);
    assert_eq!(output.summary.providers["a"].status, ProviderStatus::Completed);
}

#[tokio::test]
async fn test_message_deleted_after_listing_is_skipped() {
    let a = GmailAdapter::new(
        "a",
        "me@a.com",
        Box::new(Pruned {
            listed: vec!["deleted", "m1"],
            kept: vec![gmail_message("m1", "2026-03-03T10:00:00Z", &[("From", "zed@corp.com")])],
        }),
        token(),
    );

    let output = Pipeline::new(config())
        .with_adapter(a)
        .with_range(march())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(emails(&output), vec!["zed@corp.com"]);
    let report = &output.summary.providers["a"];
    assert_eq!(report.status, ProviderStatus::Completed);
    assert!(report.failure.is_none());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].message_id, "deleted");
    assert_eq!(report.skipped[0].reason, ReasonCode::Rejected);
    assert_eq!(output.summary.status, RunStatus::Success);
}

#[tokio::test]
async fn test_owner_spellings_never_become_contacts() {
    let a = gmail(
        "a",
        "me@gmail.com",
        vec![gmail_message(
            "m1",
            "2026-03-03T10:00:00Z",
            &[("From", "zed@corp.com"), ("To", "Me <m.e+inbox@googlemail.com>")],
        )],
    );

    let output = Pipeline::new(config())
        .with_adapter(a)
        .with_range(march())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(emails(&output), vec!["zed@corp.com"]);
    assert_eq!(output.summary.providers["a"].dropped[&ReasonCode::SelfAddress], 1);
}

#[tokio::test]
async fn test_unavailable_provider_is_reported() {
    let config = RunConfig {
        providers: BTreeSet::from(["a".to_string(), "legacy".to_string()]),
        ..config()
    };
    let a = gmail(
        "a",
        "me@a.com",
        vec![gmail_message(
            "m1",
            "2026-03-03T10:00:00Z",
            &[("From", "zed@corp.com"), ("To", "me@a.com")],
        )],
    );

    let output = Pipeline::new(config)
        .with_adapter(a)
        .with_unavailable("legacy", ProviderKind::Imap, "no IMAP session")
        .with_unavailable("ignored", ProviderKind::Imap, "no IMAP session")
        .with_range(march())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(emails(&output), vec!["zed@corp.com"]);
    let names: Vec<&str> = output.summary.providers.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["a", "legacy"]);
    let legacy = &output.summary.providers["legacy"];
    assert_eq!(legacy.kind, Some(ProviderKind::Imap));
    assert_eq!(legacy.status, ProviderStatus::Failed);
    let failure = legacy.failure.as_ref().unwrap();
    assert_eq!(failure.reason, ReasonCode::NotConfigured);
    assert_eq!(failure.detail, "no IMAP session");
    assert_eq!(output.summary.status, RunStatus::Degraded);
}
