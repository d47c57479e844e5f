//! # contactledger-core
//!
//! Core pipeline for `ContactLedger`: pulls message headers from several mail
//! providers at once, turns every address into an observation, merges
//! observations into a deduplicated contact set and optionally enriches the
//! result through rate-limited external lookups.
//!
//! This crate provides:
//! - **Provider adapters** - Gmail-like, Graph-like and IMAP-like extraction with
//!   explicit session state, retries and per-provider failure isolation
//! - **Header parsing** - Address extraction with ignore rules and reason codes
//! - **Identity normalization** - Subaddress stripping and alias-domain folding
//! - **Merge engine** - Order-independent deduplication with provenance
//! - **Enrichment** - Cached, rate-budgeted, retried lookups on a bounded worker pool
//! - **Run orchestration** - Cancellation, run summary and exit status
//!
//! ```text
//! adapters (parallel) ─→ header parser ─→ mpsc ─→ merge engine ─→ enrichment ─→ RunOutput
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod enrich;
mod error;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod provider;
pub mod retry;

pub use config::{ConfigError, IgnoreRules, NormalizeConfig, ProviderConfig, RateLimitConfig, RunConfig};
pub use credentials::{CredentialError, CredentialResult};
pub use enrich::{
    DomainInferenceSource, EnrichmentCache, EnrichmentScheduler, EnrichmentSource, HunterSource,
    LookupError, MemoryCache, RateBudget, SqliteCache,
};
pub use error::{Error, Result};
pub use merge::MergeEngine;
pub use model::{
    Contact, ContactId, EnrichmentResult, EnrichmentStatus, Provenance, RawMessage,
    RawObservation, ReasonCode, Role, RoleCounts,
};
pub use normalize::{IdentityKey, NormalizedIdentity, Normalizer};
pub use parser::{HeaderParser, ParsedMessage};
pub use pipeline::{
    Pipeline, ProviderReport, ProviderStatus, RunOutput, RunStatus, RunSummary, SourceReport,
};
pub use provider::{
    AccessToken, AuthState, DateRange, GmailAdapter, GraphAdapter, ImapAdapter, ProviderAdapter,
    ProviderError, ProviderKind,
};
pub use retry::{CallContext, RetryClass, RetryPolicy};
