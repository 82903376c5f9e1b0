//! Repository layer for database persistence.
//!
//! All database access uses Diesel with `diesel-async`'s
//! `SyncConnectionWrapper` around SQLite. Functions that take a
//! `&mut SqliteConn` are meant to run inside a caller-owned transaction;
//! the repository structs open their own connection per call.

pub mod checkpoint;
pub mod context;
pub mod dimension;
pub mod listing;
pub mod models;
pub mod pool;
pub mod util;

pub use checkpoint::CheckpointRepository;
pub use context::DbContext;
pub use dimension::DimensionRepository;
pub use listing::ListingRepository;
pub use pool::{DbError, SqliteConn, SqlitePool};

use chrono::{DateTime, Utc};

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Current time in the RFC 3339 form stored in text timestamp columns.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
