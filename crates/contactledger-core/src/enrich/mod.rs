//! Enrichment of merged contacts through external lookups.
//!
//! [`EnrichmentScheduler`] is the entry point. Sources implement
//! [`EnrichmentSource`]; results are cached in an [`EnrichmentCache`]
//! ([`MemoryCache`] per run or [`SqliteCache`] across runs).

mod budget;
mod cache;
mod domain;
mod hunter;
mod scheduler;
mod source;
mod store;

pub use budget::{RateBudget, RateLimiter};
pub use cache::{EnrichmentCache, MemoryCache, cache_key};
pub use domain::DomainInferenceSource;
pub use hunter::{HUNTER_API_BASE, HunterSource};
pub use scheduler::EnrichmentScheduler;
pub use source::{EnrichmentSource, LookupError};
pub use store::SqliteCache;
