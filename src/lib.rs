//! listing-import - resumable batch importer for business listings.
//!
//! Reads a large tabular dataset of laundromat listings, resolves the
//! state/city dimension rows each listing references, and inserts the
//! listings idempotently. Progress is checkpointed after every committed
//! batch so an interrupted run resumes exactly where it stopped.

pub mod config;
pub mod enrich;
pub mod import;
pub mod models;
pub mod repository;
pub mod schema;
