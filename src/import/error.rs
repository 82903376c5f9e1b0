//! Import error type and failure classification.

use thiserror::Error;

use super::normalize::NormalizeError;
use super::source::SourceError;
use crate::repository::util::is_constraint_violation;
use crate::repository::DbError;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("invalid record: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("checkpoint {location} is unreadable ({message}); run `reset` to start over")]
    CorruptCheckpoint { location: String, message: String },

    #[error("checkpoint {location} belongs to a different work order ({message}); rerun with --restart or use another --run-key")]
    PlanChanged { location: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("another import is running ({owner}); lock file {path}")]
    Locked { path: String, owner: String },

    #[error("giving up after {attempts} consecutive failed batches at position {position}: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        position: u64,
        last_error: String,
    },
}

impl ImportError {
    /// Whether the failure belongs to one record and must not abort its batch.
    ///
    /// Malformed rows, validation failures and constraint violations are
    /// record-level; everything else (I/O, locking, connection loss) fails
    /// the whole batch.
    pub fn is_record_level(&self) -> bool {
        match self {
            Self::Normalize(_) => true,
            Self::Source(e) => e.is_row_level(),
            Self::Database(e) => is_constraint_violation(e),
            _ => false,
        }
    }
}
