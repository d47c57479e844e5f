//! Run summary handed to the export stage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{ContactId, ReasonCode};
use crate::provider::{AuthState, ProviderKind, SkippedMessage};

/// Terminal state of one provider's extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Every page was drained (or the message cap was reached).
    Completed,
    /// Extraction stopped on an error; pages already read were kept.
    Failed,
    /// Run was cancelled before the provider finished.
    Cancelled,
}

/// Why a provider stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    /// Failure class.
    pub reason: ReasonCode,
    /// Human-readable detail.
    pub detail: String,
}

/// What happened to one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReport {
    /// Adapter variant; absent for providers that were requested but not configured.
    pub kind: Option<ProviderKind>,
    /// Terminal state.
    pub status: ProviderStatus,
    /// Set when the provider did not complete.
    pub failure: Option<ProviderFailure>,
    /// Final session state.
    pub auth_state: AuthState,
    /// Whether a session was ever established.
    pub authenticated: bool,
    /// Re-authentications performed.
    pub reauthentications: u32,
    /// Pages read.
    pub pages: usize,
    /// Messages handed to the parser.
    pub messages: usize,
    /// Observations sent to the merge engine.
    pub observations: usize,
    /// Addresses dropped by the parser, per reason.
    pub dropped: BTreeMap<ReasonCode, usize>,
    /// Messages skipped by the adapter or the parser.
    pub skipped: Vec<SkippedMessage>,
}

impl ProviderReport {
    /// Empty report for a provider that is about to run.
    #[must_use]
    pub fn new(kind: Option<ProviderKind>) -> Self {
        Self {
            kind,
            status: ProviderStatus::Completed,
            failure: None,
            auth_state: AuthState::Unauthenticated,
            authenticated: false,
            reauthentications: 0,
            pages: 0,
            messages: 0,
            observations: 0,
            dropped: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    /// Marks the provider as stopped by `reason`.
    pub fn fail(&mut self, reason: ReasonCode, detail: impl Into<String>) {
        self.status = if reason == ReasonCode::Cancelled {
            ProviderStatus::Cancelled
        } else {
            ProviderStatus::Failed
        };
        self.failure = Some(ProviderFailure {
            reason,
            detail: detail.into(),
        });
    }
}

/// A lookup that did not produce data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupFailure {
    /// Contact the lookup was for.
    pub contact: ContactId,
    /// Failure class.
    pub reason: ReasonCode,
    /// Human-readable detail.
    pub detail: String,
}

/// Enrichment outcome counts for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    /// Lookups answered by the source.
    pub succeeded: usize,
    /// Lookups answered from the cache without a call.
    pub cache_hits: usize,
    /// Lookups that failed.
    pub failed: usize,
    /// Contacts that could not be looked up.
    pub skipped: usize,
    /// Every failed lookup.
    pub failures: Vec<LookupFailure>,
}

impl SourceReport {
    /// Contacts that reached a terminal state for this source.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.succeeded + self.cache_hits + self.failed + self.skipped
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every provider completed.
    Success,
    /// Some providers failed or were cancelled; the output is partial.
    Degraded,
    /// No provider could authenticate and nothing was produced.
    Fatal,
}

impl RunStatus {
    /// Derives the status from the provider reports and the contact count.
    #[must_use]
    pub fn evaluate(providers: &BTreeMap<String, ProviderReport>, contacts: usize) -> Self {
        let any_authenticated = providers.values().any(|p| p.authenticated);
        if !any_authenticated && contacts == 0 {
            Self::Fatal
        } else if providers
            .values()
            .all(|p| p.status == ProviderStatus::Completed)
        {
            Self::Success
        } else {
            Self::Degraded
        }
    }

    /// Process exit code: 0 success, 2 degraded, 1 fatal.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Degraded => 2,
            Self::Fatal => 1,
        }
    }
}

/// Everything the export stage needs to know about a run besides the contacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Overall outcome.
    pub status: RunStatus,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Per-provider extraction reports.
    pub providers: BTreeMap<String, ProviderReport>,
    /// Per-source enrichment reports; empty when enrichment was off.
    pub sources: BTreeMap<String, SourceReport>,
    /// Contacts produced.
    pub contacts: usize,
    /// Contacts keyed by display name only.
    pub low_confidence_contacts: usize,
    /// Observations the merge engine accepted.
    pub observations: usize,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(authenticated: bool, status: ProviderStatus) -> ProviderReport {
        let mut report = ProviderReport::new(Some(ProviderKind::Gmail));
        report.authenticated = authenticated;
        report.status = status;
        report
    }

    #[test]
    fn test_status_success() {
        let providers = BTreeMap::from([
            ("a".to_string(), report(true, ProviderStatus::Completed)),
            ("b".to_string(), report(true, ProviderStatus::Completed)),
        ]);
        assert_eq!(RunStatus::evaluate(&providers, 3), RunStatus::Success);
    }

    #[test]
    fn test_status_degraded() {
        let providers = BTreeMap::from([
            ("a".to_string(), report(true, ProviderStatus::Completed)),
            ("b".to_string(), report(false, ProviderStatus::Failed)),
        ]);
        assert_eq!(RunStatus::evaluate(&providers, 3), RunStatus::Degraded);
        assert_eq!(RunStatus::Degraded.exit_code(), 2);
    }

    #[test]
    fn test_status_fatal_only_without_auth_and_contacts() {
        let providers = BTreeMap::from([("a".to_string(), report(false, ProviderStatus::Failed))]);
        assert_eq!(RunStatus::evaluate(&providers, 0), RunStatus::Fatal);
        assert_eq!(RunStatus::evaluate(&providers, 1), RunStatus::Degraded);
        assert_eq!(RunStatus::evaluate(&BTreeMap::new(), 0), RunStatus::Fatal);
        assert_eq!(RunStatus::Fatal.exit_code(), 1);
    }

    #[test]
    fn test_fail_marks_cancelled() {
        let mut report = ProviderReport::new(None);
        report.fail(ReasonCode::Cancelled, "run cancelled");
        assert_eq!(report.status, ProviderStatus::Cancelled);
        report.fail(ReasonCode::AuthFailed, "bad token");
        assert_eq!(report.status, ProviderStatus::Failed);
        assert_eq!(report.failure.unwrap().reason, ReasonCode::AuthFailed);
    }
}
