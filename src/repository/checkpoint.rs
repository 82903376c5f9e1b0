//! Checkpoint rows keyed by run key.
//!
//! The payload is the same JSON document the file-backed store writes; the
//! table only adds a key and a timestamp around it.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::models::CheckpointRow;
use super::now_rfc3339;
use super::pool::{DbError, SqlitePool};
use crate::schema::import_checkpoints;

#[derive(Clone)]
pub struct CheckpointRepository {
    pool: SqlitePool,
}

impl CheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load the stored JSON for a run key.
    pub async fn load(&self, run_key: &str) -> Result<Option<String>, DbError> {
        let mut conn = self.pool.get().await?;
        import_checkpoints::table
            .find(run_key)
            .select(CheckpointRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map(|row| row.map(|r| r.data))
    }

    /// Save the JSON for a run key in a single statement.
    pub async fn save(&self, run_key: &str, data: &str) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        diesel::replace_into(import_checkpoints::table)
            .values((
                import_checkpoints::run_key.eq(run_key),
                import_checkpoints::data.eq(data),
                import_checkpoints::updated_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    /// Delete the checkpoint for a run key.
    pub async fn delete(&self, run_key: &str) -> Result<bool, DbError> {
        let mut conn = self.pool.get().await?;
        let rows = diesel::delete(import_checkpoints::table.find(run_key))
            .execute(&mut conn)
            .await?;
        Ok(rows > 0)
    }

    /// Move a checkpoint to a new key, e.g. when archiving a finished run.
    pub async fn rename(&self, run_key: &str, new_key: &str) -> Result<bool, DbError> {
        let mut conn = self.pool.get().await?;
        let rows = diesel::update(import_checkpoints::table.find(run_key))
            .set(import_checkpoints::run_key.eq(new_key))
            .execute(&mut conn)
            .await?;
        Ok(rows > 0)
    }

    /// All run keys, including archived ones.
    pub async fn keys(&self) -> Result<Vec<String>, DbError> {
        let mut conn = self.pool.get().await?;
        import_checkpoints::table
            .select(import_checkpoints::run_key)
            .order(import_checkpoints::run_key.asc())
            .load(&mut conn)
            .await
    }
}
