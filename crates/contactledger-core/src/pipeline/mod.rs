//! Run orchestration.
//!
//! Every provider is extracted in its own task. Tasks parse messages as pages
//! arrive and push observations into one channel; the merge engine is its
//! only consumer. Once every producer has finished (completed, failed or
//! cancelled) the contact set is built and, when enabled, enriched.

mod summary;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use summary::{
    LookupFailure, ProviderFailure, ProviderReport, ProviderStatus, RunStatus, RunSummary,
    SourceReport,
};

use crate::config::RunConfig;
use crate::enrich::{
    DomainInferenceSource, EnrichmentCache, EnrichmentScheduler, EnrichmentSource, MemoryCache,
};
use crate::error::{Error, Result};
use crate::merge::MergeEngine;
use crate::model::{Contact, RawObservation, ReasonCode};
use crate::normalize::Normalizer;
use crate::parser::HeaderParser;
use crate::provider::{DateRange, ProviderAdapter, ProviderKind, SkippedMessage};
use crate::retry::CallContext;

/// Observations buffered between the extraction tasks and the merge engine.
const OBSERVATION_BUFFER: usize = 1024;

/// Contacts and summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Contacts ordered by `first_seen`.
    pub contacts: Vec<Contact>,
    /// What happened.
    pub summary: RunSummary,
}

/// One extraction run over a set of providers.
pub struct Pipeline {
    config: RunConfig,
    adapters: Vec<ProviderAdapter>,
    unavailable: Vec<(String, ProviderKind, String)>,
    sources: Vec<Arc<dyn EnrichmentSource>>,
    cache: Option<Arc<dyn EnrichmentCache>>,
    range: Option<DateRange>,
}

impl Pipeline {
    /// Creates a run with no providers.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            unavailable: Vec::new(),
            sources: Vec::new(),
            cache: None,
            range: None,
        }
    }

    /// Adds a provider.
    #[must_use]
    pub fn with_adapter(mut self, adapter: impl Into<ProviderAdapter>) -> Self {
        self.adapters.push(adapter.into());
        self
    }

    /// Records a configured provider that cannot run in this build.
    ///
    /// If selected it is reported as [`ReasonCode::NotConfigured`] with
    /// `detail`, next to the providers that did run.
    #[must_use]
    pub fn with_unavailable(
        mut self,
        name: impl Into<String>,
        kind: ProviderKind,
        detail: impl Into<String>,
    ) -> Self {
        self.unavailable.push((name.into(), kind, detail.into()));
        self
    }

    /// Sets the enrichment sources (in preference order) and cache.
    ///
    /// Without this call an enabled enrichment stage uses the offline domain
    /// source, if configured, and a per-run memory cache.
    #[must_use]
    pub fn with_enrichment(
        mut self,
        sources: Vec<Arc<dyn EnrichmentSource>>,
        cache: Arc<dyn EnrichmentCache>,
    ) -> Self {
        self.sources = sources;
        self.cache = Some(cache);
        self
    }

    /// Overrides the date range derived from `days_back`.
    #[must_use]
    pub const fn with_range(mut self, range: DateRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Runs extraction, merge and enrichment to completion.
    ///
    /// Provider and lookup failures never fail the run; they are reported in
    /// the summary. Cancellation stops outstanding work promptly and returns
    /// whatever was merged so far.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration does not validate.
    pub async fn run(self, cancel: &CancellationToken) -> Result<RunOutput> {
        self.config.validate().map_err(Error::InvalidConfig)?;
        let started = Instant::now();
        let range = self
            .range
            .unwrap_or_else(|| DateRange::last_days(self.config.days_back, Utc::now()));
        let ctx = CallContext::new(
            self.config.retry.clone(),
            self.config.operation_timeout,
            cancel.clone(),
        );

        let mut providers = BTreeMap::new();
        let (tx, mut rx) = mpsc::channel(OBSERVATION_BUFFER);
        let mut tasks = JoinSet::new();

        for adapter in self.adapters {
            let name = adapter.name().to_string();
            if !self.config.selects(&name) {
                debug!(provider = %name, "provider not selected");
                continue;
            }
            if providers.contains_key(&name) {
                warn!(provider = %name, "duplicate provider name ignored");
                continue;
            }

            // Replaced by the task's own report when it finishes.
            let mut placeholder = ProviderReport::new(Some(adapter.kind()));
            placeholder.fail(ReasonCode::Internal, "extraction task ended abnormally");
            providers.insert(name, placeholder);

            let parser = HeaderParser::new(
                adapter.account(),
                self.config.ignore.clone(),
                Normalizer::new(self.config.normalize.clone()),
            );
            let extraction = Extraction {
                range,
                parser,
                ctx: ctx.clone(),
                tx: tx.clone(),
                max_messages: self.config.max_messages_per_provider,
            };
            tasks.spawn(extraction.run(adapter));
        }
        drop(tx);

        for (name, kind, detail) in self.unavailable {
            if !self.config.selects(&name) || providers.contains_key(&name) {
                continue;
            }
            warn!(provider = %name, %detail, "provider unavailable");
            let mut report = ProviderReport::new(Some(kind));
            report.fail(ReasonCode::NotConfigured, detail);
            providers.insert(name, report);
        }

        for name in &self.config.providers {
            if !providers.contains_key(name) {
                warn!(provider = %name, "provider requested but not configured");
                let mut report = ProviderReport::new(None);
                report.fail(ReasonCode::NotConfigured, "no adapter configured for this provider");
                providers.insert(name.clone(), report);
            }
        }

        let mut engine = MergeEngine::new(Normalizer::new(self.config.normalize.clone()));
        while let Some(observation) = rx.recv().await {
            engine.observe(observation);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, report)) => {
                    providers.insert(name, report);
                }
                Err(e) => warn!(error = %e, "extraction task ended abnormally"),
            }
        }

        let observations = engine.accepted();
        let mut contacts = engine.finish();
        info!(contacts = contacts.len(), observations, "merge complete");

        let mut sources = BTreeMap::new();
        if self.config.enrich && !contacts.is_empty() {
            let (enrich_sources, cache) = match self.cache {
                Some(cache) => (self.sources, cache),
                None => {
                    let cache: Arc<dyn EnrichmentCache> = Arc::new(MemoryCache::new());
                    (default_sources(&self.config), cache)
                }
            };
            if enrich_sources.is_empty() {
                warn!("enrichment enabled but no source is available");
            } else {
                let scheduler = EnrichmentScheduler::new(enrich_sources, cache, &self.config);
                sources = scheduler.run(&mut contacts, cancel).await;
            }
        }

        let scored_at = Utc::now();
        for contact in &mut contacts {
            contact.rescore(scored_at);
        }

        let low_confidence_contacts = contacts.iter().filter(|c| c.low_confidence).count();
        let status = RunStatus::evaluate(&providers, contacts.len());
        let summary = RunSummary {
            status,
            cancelled: cancel.is_cancelled(),
            providers,
            sources,
            contacts: contacts.len(),
            low_confidence_contacts,
            observations,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(status = ?summary.status, duration_ms = summary.duration_ms, "run finished");

        Ok(RunOutput { contacts, summary })
    }
}

/// Sources that need nothing beyond the configuration.
fn default_sources(config: &RunConfig) -> Vec<Arc<dyn EnrichmentSource>> {
    config
        .enrichment_sources
        .iter()
        .filter_map(|name| {
            if name == DomainInferenceSource::NAME {
                Some(Arc::new(DomainInferenceSource::new()) as Arc<dyn EnrichmentSource>)
            } else {
                warn!(source = %name, "enrichment source needs credentials and was not supplied");
                None
            }
        })
        .collect()
}

/// Everything one provider task needs.
struct Extraction {
    range: DateRange,
    parser: HeaderParser,
    ctx: CallContext,
    tx: mpsc::Sender<RawObservation>,
    max_messages: Option<usize>,
}

impl Extraction {
    async fn run(self, mut adapter: ProviderAdapter) -> (String, ProviderReport) {
        let name = adapter.name().to_string();
        let mut report = ProviderReport::new(Some(adapter.kind()));
        info!(provider = %name, kind = %adapter.kind(), "extraction started");

        match adapter.authenticate(&self.ctx).await {
            Ok(()) => {
                report.authenticated = true;
                self.drain(&mut adapter, &name, &mut report).await;
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "authentication failed, provider excluded");
                report.fail(e.reason_code(), e.to_string());
            }
        }

        report.auth_state = adapter.auth_state();
        report.reauthentications = adapter.reauthentications();
        info!(
            provider = %name,
            status = ?report.status,
            messages = report.messages,
            observations = report.observations,
            skipped = report.skipped.len(),
            "extraction finished"
        );
        (name, report)
    }

    async fn drain(&self, adapter: &mut ProviderAdapter, name: &str, report: &mut ProviderReport) {
        let capped =
            |report: &ProviderReport| self.max_messages.is_some_and(|max| report.messages >= max);
        let mut cursor = None;

        loop {
            if self.ctx.cancel.is_cancelled() {
                report.fail(ReasonCode::Cancelled, "run cancelled");
                return;
            }
            if capped(report) {
                info!(provider = %name, messages = report.messages, "message cap reached");
                return;
            }

            let page = match adapter.fetch_page(&self.range, cursor.as_ref(), &self.ctx).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(provider = %name, error = %e, "extraction stopped");
                    report.fail(e.reason_code(), e.to_string());
                    return;
                }
            };
            report.pages += 1;
            for skipped in &page.skipped {
                debug!(provider = %name, message = %skipped.message_id, reason = %skipped.reason, "message skipped");
            }
            report.skipped.extend(page.skipped);

            for message in page.messages {
                if capped(report) {
                    info!(provider = %name, messages = report.messages, "message cap reached");
                    return;
                }
                report.messages += 1;

                let parsed = match self.parser.parse(name, &message) {
                    Ok(parsed) => parsed,
                    Err(reason) => {
                        debug!(provider = %name, message = %message.id, %reason, "message skipped");
                        report.skipped.push(SkippedMessage {
                            message_id: message.id.clone(),
                            reason,
                            detail: "message has no usable timestamp".to_string(),
                        });
                        continue;
                    }
                };

                for dropped in &parsed.dropped {
                    debug!(provider = %name, message = %message.id, role = ?dropped.role, reason = %dropped.reason, "address dropped");
                    *report.dropped.entry(dropped.reason).or_default() += 1;
                }
                for observation in parsed.observations {
                    if self.tx.send(observation).await.is_err() {
                        report.fail(ReasonCode::Cancelled, "merge stage closed");
                        return;
                    }
                    report.observations += 1;
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => return,
            }
        }
    }
}
