//! Data models for listing-import.

mod listing;
mod record;

pub use listing::{GeocodeCandidate, StateSummary};
pub use record::{CanonicalRecord, Coordinates, FeatureFlags, SourceRecord, StateRef};
