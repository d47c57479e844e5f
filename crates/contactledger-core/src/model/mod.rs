//! Domain model: messages, observations, contacts and enrichment results.

mod contact;
mod enrichment;
mod observation;
mod reason;

pub(crate) use contact::name_key;
pub use contact::{Contact, ContactId, EnrichmentStatus, Provenance, RoleCounts};
pub use enrichment::{EnrichmentFields, EnrichmentResult};
pub use observation::{RawMessage, RawObservation, Role};
pub use reason::ReasonCode;
