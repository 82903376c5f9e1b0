//! Database context for managing connections and repository access.
//!
//! The DbContext is the primary entry point for all database operations.
//! It holds the connection pool and provides access to all repositories.

use std::path::Path;

use diesel_async::SimpleAsyncConnection;

use super::checkpoint::CheckpointRepository;
use super::dimension::DimensionRepository;
use super::listing::ListingRepository;
use super::pool::{DbError, SqliteConn, SqlitePool};

/// Database context that manages the connection pool and provides repository access.
///
/// # Example
/// ```ignore
/// let ctx = DbContext::new(&settings.database_path());
/// ctx.init_schema().await?;
/// let total = ctx.listings().count().await?;
/// ```
#[derive(Clone, Debug)]
pub struct DbContext {
    pool: SqlitePool,
}

impl DbContext {
    /// Create a context from a database file path.
    pub fn new(db_path: &Path) -> Self {
        Self {
            pool: SqlitePool::from_path(db_path),
        }
    }

    /// Create a context from a database URL (`sqlite:` prefix optional).
    pub fn from_url(url: &str) -> Self {
        Self {
            pool: SqlitePool::new(url),
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a connection for caller-managed transactions.
    pub async fn connect(&self) -> Result<SqliteConn, DbError> {
        self.pool.get().await
    }

    /// Get a state/city repository.
    pub fn dimensions(&self) -> DimensionRepository {
        DimensionRepository::new(self.pool.clone())
    }

    /// Get a listing repository.
    pub fn listings(&self) -> ListingRepository {
        ListingRepository::new(self.pool.clone())
    }

    /// Get a checkpoint repository.
    pub fn checkpoints(&self) -> CheckpointRepository {
        CheckpointRepository::new(self.pool.clone())
    }

    /// Initialize database schema.
    pub async fn init_schema(&self) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        conn.batch_execute(include_str!("schema_sqlite.sql")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_schema_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = DbContext::new(&dir.path().join("listings.db"));
        ctx.init_schema().await.unwrap();
        ctx.init_schema().await.unwrap();

        assert_eq!(ctx.listings().count().await.unwrap(), 0);
        assert_eq!(ctx.dimensions().count_states().await.unwrap(), 0);
    }
}
