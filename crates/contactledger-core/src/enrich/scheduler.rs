//! Drives every contact through every configured source.
//!
//! Each (contact, source) pair becomes one lookup task. A lookup first
//! consults the cache; on a miss it takes a slot in the source's lane and
//! in the shared worker pool, waits for the source's rate budget, and calls
//! the source under the retry policy. Results are applied to the contacts by
//! this task alone, after the lookups finish.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::budget::{RateBudget, RateLimiter};
use super::cache::{EnrichmentCache, cache_key};
use super::source::{EnrichmentSource, LookupError};
use crate::config::{RateLimitConfig, RunConfig};
use crate::model::{Contact, EnrichmentResult, EnrichmentStatus, ReasonCode};
use crate::pipeline::{LookupFailure, SourceReport};
use crate::retry::{RetryPolicy, retry_unbounded, with_deadline};

struct SourceSlot {
    source: Arc<dyn EnrichmentSource>,
    concurrency: usize,
    rate_limit: RateLimitConfig,
}

/// Per-run state of one source.
struct Lane {
    source: Arc<dyn EnrichmentSource>,
    permits: Semaphore,
    limiter: RateLimiter,
}

/// Per-run state shared by all lookups.
struct Shared {
    cache: Arc<dyn EnrichmentCache>,
    workers: Semaphore,
    ttl: Duration,
    policy: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
}

enum Outcome {
    Fetched(EnrichmentResult),
    Cached(EnrichmentResult),
    Failed(LookupError),
}

/// Bounded-concurrency enrichment with caching and per-source rate budgets.
pub struct EnrichmentScheduler {
    slots: Vec<SourceSlot>,
    cache: Arc<dyn EnrichmentCache>,
    workers: usize,
    ttl: Duration,
    policy: RetryPolicy,
    timeout: Duration,
}

impl EnrichmentScheduler {
    /// Creates a scheduler over `sources`, in preference order.
    ///
    /// Worker count, per-source concurrency, rate limits, TTL, retry policy
    /// and call deadline come from `config`. A source name that appears twice
    /// is used once.
    #[must_use]
    pub fn new(
        sources: Vec<Arc<dyn EnrichmentSource>>,
        cache: Arc<dyn EnrichmentCache>,
        config: &RunConfig,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let slots = sources
            .into_iter()
            .filter(|source| {
                let fresh = seen.insert(source.name().to_string());
                if !fresh {
                    warn!(source = source.name(), "duplicate enrichment source ignored");
                }
                fresh
            })
            .map(|source| SourceSlot {
                concurrency: config.concurrency_for(source.name()),
                rate_limit: config.rate_limit_for(source.name()),
                source,
            })
            .collect();

        Self {
            slots,
            cache,
            workers: config.workers.max(1),
            ttl: config.cache_ttl,
            policy: config.retry.clone(),
            timeout: config.operation_timeout,
        }
    }

    /// Names of the sources in use.
    #[must_use]
    pub fn source_names(&self) -> Vec<&str> {
        self.slots.iter().map(|slot| slot.source.name()).collect()
    }

    /// Enriches `contacts` in place and reports per-source outcomes.
    ///
    /// Returns once every contact has a terminal state for every source.
    /// Rate budgets start empty on every call. Cancellation makes pending
    /// lookups fail with [`ReasonCode::Cancelled`]; results that already
    /// arrived stay attached.
    pub async fn run(
        &self,
        contacts: &mut [Contact],
        cancel: &CancellationToken,
    ) -> BTreeMap<String, SourceReport> {
        let shared = Arc::new(Shared {
            cache: Arc::clone(&self.cache),
            workers: Semaphore::new(self.workers),
            ttl: self.ttl,
            policy: self.policy.clone(),
            timeout: self.timeout,
            cancel: cancel.clone(),
        });
        let lanes: Vec<Arc<Lane>> = self
            .slots
            .iter()
            .map(|slot| {
                Arc::new(Lane {
                    source: Arc::clone(&slot.source),
                    permits: Semaphore::new(slot.concurrency),
                    limiter: RateLimiter::new(
                        slot.source.name(),
                        RateBudget::from_config(slot.rate_limit),
                    ),
                })
            })
            .collect();

        let mut reports: BTreeMap<String, SourceReport> = self
            .source_names()
            .into_iter()
            .map(|name| (name.to_string(), SourceReport::default()))
            .collect();

        let mut tasks = JoinSet::new();
        for (index, contact) in contacts.iter_mut().enumerate() {
            let Some(email) = contact.canonical_email.clone() else {
                for lane in &lanes {
                    let name = lane.source.name();
                    contact.enrichment_status.insert(
                        name.to_string(),
                        EnrichmentStatus::Skipped {
                            reason: ReasonCode::NoEmail,
                        },
                    );
                    if let Some(report) = reports.get_mut(name) {
                        report.skipped += 1;
                    }
                }
                continue;
            };

            for (lane_index, lane) in lanes.iter().enumerate() {
                let lane = Arc::clone(lane);
                let shared = Arc::clone(&shared);
                let email = email.clone();
                let domain = contact.domain.clone();
                tasks.spawn(async move {
                    let outcome = lookup(&lane, &shared, &email, domain.as_deref()).await;
                    (index, lane_index, outcome)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, lane_index, outcome)) => {
                    let (Some(contact), Some(lane)) =
                        (contacts.get_mut(index), lanes.get(lane_index))
                    else {
                        continue;
                    };
                    let name = lane.source.name();
                    if let Some(report) = reports.get_mut(name) {
                        apply(contact, name, outcome, report);
                    }
                }
                Err(e) => warn!(error = %e, "enrichment task ended abnormally"),
            }
        }

        // Lookups whose task died without an answer still need a terminal state.
        for contact in contacts.iter_mut().filter(|c| c.canonical_email.is_some()) {
            for lane in &lanes {
                let name = lane.source.name();
                if contact.enrichment_status.contains_key(name) {
                    continue;
                }
                if let Some(report) = reports.get_mut(name) {
                    record_failure(
                        contact,
                        name,
                        ReasonCode::Internal,
                        "lookup task ended without a result",
                        report,
                    );
                }
            }
        }

        for (name, report) in &reports {
            info!(
                source = %name,
                succeeded = report.succeeded,
                cache_hits = report.cache_hits,
                failed = report.failed,
                skipped = report.skipped,
                "enrichment source finished"
            );
        }
        reports
    }
}

async fn lookup(lane: &Lane, shared: &Shared, email: &str, domain: Option<&str>) -> Outcome {
    let name = lane.source.name();
    let key = cache_key(name, email);

    match shared.cache.get(&key).await {
        Ok(Some(cached)) if !cached.is_expired(Utc::now()) => {
            debug!(source = name, contact = email, "enrichment cache hit");
            return Outcome::Cached(cached);
        }
        Ok(_) => {}
        Err(e) => warn!(source = name, error = %e, "enrichment cache read failed"),
    }

    let permits = tokio::select! {
        biased;
        () = shared.cancel.cancelled() => None,
        permits = async {
            let lane_permit = lane.permits.acquire().await.ok()?;
            let worker = shared.workers.acquire().await.ok()?;
            Some((lane_permit, worker))
        } => permits,
    };
    let Some(_permits) = permits else {
        return Outcome::Failed(LookupError::Cancelled);
    };

    let source = lane.source.as_ref();
    let limiter = &lane.limiter;
    let cancel = &shared.cancel;
    let timeout = shared.timeout;
    let fetched = retry_unbounded(&shared.policy, cancel, name, move || async move {
        if !limiter.acquire(cancel).await {
            return Err(LookupError::Cancelled);
        }
        with_deadline(timeout, source.lookup(email, domain)).await
    })
    .await;

    match fetched {
        Ok(fields) => {
            let result = EnrichmentResult {
                source: name.to_string(),
                fetched_at: Utc::now(),
                fields,
                cache_key: key,
                ttl: shared.ttl,
                confidence: source.confidence(),
            };
            if let Err(e) = shared.cache.put(&result.cache_key, &result, shared.ttl).await {
                warn!(source = name, error = %e, "enrichment cache write failed");
            }
            Outcome::Fetched(result)
        }
        Err(e) => Outcome::Failed(e),
    }
}

fn apply(contact: &mut Contact, source: &str, outcome: Outcome, report: &mut SourceReport) {
    match outcome {
        Outcome::Fetched(result) => {
            contact.attach_enrichment(result, Utc::now());
            contact
                .enrichment_status
                .insert(source.to_string(), EnrichmentStatus::Enriched);
            report.succeeded += 1;
        }
        Outcome::Cached(result) => {
            contact.attach_enrichment(result, Utc::now());
            contact
                .enrichment_status
                .insert(source.to_string(), EnrichmentStatus::CacheHit);
            report.cache_hits += 1;
        }
        Outcome::Failed(error) => {
            debug!(source, contact = %contact.id, error = %error, "enrichment lookup failed");
            record_failure(contact, source, error.reason_code(), error.to_string(), report);
        }
    }
}

fn record_failure(
    contact: &mut Contact,
    source: &str,
    reason: ReasonCode,
    detail: impl Into<String>,
    report: &mut SourceReport,
) {
    let detail = detail.into();
    contact.enrichment_status.insert(
        source.to_string(),
        EnrichmentStatus::Failed {
            reason,
            detail: detail.clone(),
        },
    );
    report.failed += 1;
    report.failures.push(LookupFailure {
        contact: contact.id.clone(),
        reason,
        detail,
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::enrich::MemoryCache;
    use crate::model::{ContactId, EnrichmentFields, RoleCounts};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    type Respond = fn(&str, u32) -> Result<EnrichmentFields, LookupError>;

    struct ScriptedSource {
        name: &'static str,
        confidence: f32,
        delay: Duration,
        respond: Respond,
        calls: AtomicU32,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(name: &'static str, confidence: f32, respond: Respond) -> Arc<Self> {
            Self::slow(name, confidence, respond, Duration::ZERO)
        }

        fn slow(name: &'static str, confidence: f32, respond: Respond, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                confidence,
                delay,
                respond,
                calls: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnrichmentSource for ScriptedSource {
        fn name(&self) -> &str {
            self.name
        }

        fn confidence(&self) -> f32 {
            self.confidence
        }

        async fn lookup(
            &self,
            email: &str,
            _domain: Option<&str>,
        ) -> Result<EnrichmentFields, LookupError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.respond)(email, call)
        }
    }

    fn found(email: &str, _call: u32) -> Result<EnrichmentFields, LookupError> {
        Ok(EnrichmentFields::from([("email".to_string(), email.into())]))
    }

    fn contact(email: Option<&str>) -> Contact {
        let now = Utc::now();
        let key = email.unwrap_or("name:nobody");
        Contact {
            id: ContactId::from_key(key),
            canonical_email: email.map(ToString::to_string),
            canonical_name: String::new(),
            display_name: String::new(),
            domain: email.and_then(|e| e.split_once('@')).map(|(_, d)| d.to_string()),
            low_confidence: email.is_none(),
            provenance: BTreeSet::new(),
            first_seen: now,
            last_seen: now,
            role_counts: RoleCounts::default(),
            account_stats: BTreeMap::new(),
            relationship_strength: 0.0,
            enrichment: None,
            enrichment_status: BTreeMap::new(),
        }
    }

    fn config() -> RunConfig {
        RunConfig {
            retry: RetryPolicy::immediate(3),
            ..RunConfig::default()
        }
    }

    fn scheduler(
        sources: &[Arc<ScriptedSource>],
        cache: &Arc<MemoryCache>,
        config: &RunConfig,
    ) -> EnrichmentScheduler {
        let sources = sources
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn EnrichmentSource>)
            .collect();
        EnrichmentScheduler::new(sources, Arc::clone(cache) as Arc<dyn EnrichmentCache>, config)
    }

    #[tokio::test]
    async fn test_second_run_served_from_cache() {
        let source = ScriptedSource::new("scripted", 0.5, found);
        let cache = Arc::new(MemoryCache::new());
        let scheduler = scheduler(&[Arc::clone(&source)], &cache, &config());
        let cancel = CancellationToken::new();

        let mut first = vec![contact(Some("a@x.com")), contact(Some("b@x.com"))];
        let reports = scheduler.run(&mut first, &cancel).await;
        assert_eq!(reports["scripted"].succeeded, 2);
        assert_eq!(source.calls(), 2);

        let mut second = vec![contact(Some("a@x.com")), contact(Some("b@x.com"))];
        let reports = scheduler.run(&mut second, &cancel).await;
        assert_eq!(reports["scripted"].cache_hits, 2);
        assert_eq!(source.calls(), 2);
        assert_eq!(second[0].enrichment, first[0].enrichment);
        assert_eq!(second[0].enrichment_status["scripted"], EnrichmentStatus::CacheHit);
    }

    #[tokio::test]
    async fn test_contact_without_email_is_skipped() {
        let source = ScriptedSource::new("scripted", 0.5, found);
        let cache = Arc::new(MemoryCache::new());
        let scheduler = scheduler(&[Arc::clone(&source)], &cache, &config());

        let mut contacts = vec![contact(None)];
        let reports = scheduler.run(&mut contacts, &CancellationToken::new()).await;
        assert_eq!(reports["scripted"].skipped, 1);
        assert_eq!(source.calls(), 0);
        assert_eq!(
            contacts[0].enrichment_status["scripted"],
            EnrichmentStatus::Skipped {
                reason: ReasonCode::NoEmail
            }
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_not_retried() {
        fn not_for_b(email: &str, call: u32) -> Result<EnrichmentFields, LookupError> {
            if email.starts_with('b') {
                Err(LookupError::NotFound)
            } else {
                found(email, call)
            }
        }
        let source = ScriptedSource::new("scripted", 0.5, not_for_b);
        let cache = Arc::new(MemoryCache::new());
        let scheduler = scheduler(&[Arc::clone(&source)], &cache, &config());

        let mut contacts = vec![contact(Some("a@x.com")), contact(Some("b@x.com"))];
        let reports = scheduler.run(&mut contacts, &CancellationToken::new()).await;
        let report = &reports["scripted"];
        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert_eq!(report.failures[0].contact, contacts[1].id);
        assert_eq!(report.failures[0].reason, ReasonCode::NotFound);
        assert_eq!(source.calls(), 2);
        assert!(contacts[0].enrichment.is_some());
        assert!(contacts[1].enrichment.is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_retried_to_the_bound() {
        fn always_down(_: &str, _: u32) -> Result<EnrichmentFields, LookupError> {
            Err(LookupError::Transient("HTTP 503".into()))
        }
        let source = ScriptedSource::new("scripted", 0.5, always_down);
        let cache = Arc::new(MemoryCache::new());
        let scheduler = scheduler(&[Arc::clone(&source)], &cache, &config());

        let mut contacts = vec![contact(Some("a@x.com"))];
        scheduler.run(&mut contacts, &CancellationToken::new()).await;
        assert_eq!(source.calls(), 3);
        assert!(matches!(
            &contacts[0].enrichment_status["scripted"],
            EnrichmentStatus::Failed { reason: ReasonCode::TransientExhausted, .. }
        ));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        fn second_time_lucky(email: &str, call: u32) -> Result<EnrichmentFields, LookupError> {
            if call == 1 {
                Err(LookupError::Transient("reset".into()))
            } else {
                found(email, call)
            }
        }
        let source = ScriptedSource::new("scripted", 0.5, second_time_lucky);
        let cache = Arc::new(MemoryCache::new());
        let scheduler = scheduler(&[Arc::clone(&source)], &cache, &config());

        let mut contacts = vec![contact(Some("a@x.com"))];
        let reports = scheduler.run(&mut contacts, &CancellationToken::new()).await;
        assert_eq!(reports["scripted"].succeeded, 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_highest_confidence_result_attached() {
        let low = ScriptedSource::new("low", 0.3, found);
        let high = ScriptedSource::new("high", 0.7, found);
        let cache = Arc::new(MemoryCache::new());
        let scheduler = scheduler(&[low, high], &cache, &config());

        let mut contacts = vec![contact(Some("a@x.com"))];
        scheduler.run(&mut contacts, &CancellationToken::new()).await;
        assert_eq!(contacts[0].enrichment.as_ref().unwrap().source, "high");
        assert_eq!(contacts[0].enrichment_status.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_concurrency_bounded() {
        let source = ScriptedSource::slow("scripted", 0.5, found, Duration::from_millis(100));
        let cache = Arc::new(MemoryCache::new());
        let mut config = config();
        config
            .max_concurrency_per_source
            .insert("scripted".to_string(), 2);
        let scheduler = scheduler(&[Arc::clone(&source)], &cache, &config);

        let mut contacts: Vec<Contact> = (0..10)
            .map(|i| contact(Some(&format!("user{i}@x.com"))))
            .collect();
        let reports = scheduler.run(&mut contacts, &CancellationToken::new()).await;
        assert_eq!(reports["scripted"].succeeded, 10);
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_reaches_terminal_states() {
        let source = ScriptedSource::new("scripted", 0.5, found);
        let cache = Arc::new(MemoryCache::new());
        let scheduler = scheduler(&[Arc::clone(&source)], &cache, &config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut contacts = vec![contact(Some("a@x.com")), contact(Some("b@x.com"))];
        let reports = scheduler.run(&mut contacts, &cancel).await;
        assert_eq!(reports["scripted"].failed, 2);
        assert_eq!(reports["scripted"].total(), 2);
        assert_eq!(source.calls(), 0);
        assert!(contacts.iter().all(|c| matches!(
            c.enrichment_status["scripted"],
            EnrichmentStatus::Failed { reason: ReasonCode::Cancelled, .. }
        )));
    }

    #[test]
    fn test_duplicate_sources_used_once() {
        let a = ScriptedSource::new("same", 0.5, found);
        let b = ScriptedSource::new("same", 0.9, found);
        let cache = Arc::new(MemoryCache::new());
        let scheduler = scheduler(&[a, b], &cache, &config());
        assert_eq!(scheduler.source_names(), vec!["same"]);
    }
}
