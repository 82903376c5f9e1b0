//! State/city resolution with a per-run cache.

use std::collections::HashMap;

use super::slug::slugify;
use crate::models::StateRef;
use crate::repository::dimension::{ensure_city, ensure_state};
use crate::repository::models::{NewCity, NewState};
use crate::repository::{now_rfc3339, DbError, SqliteConn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CacheKey {
    State(String),
    City(i32, String),
}

/// Resolves dimension rows to ids, creating them on first use.
///
/// Ids are cached for the life of the run. Every cache insertion is
/// journaled so that entries created inside a transaction that later rolls
/// back can be discarded with [`rollback_to`](Self::rollback_to); otherwise
/// the cache would hand out ids of rows that no longer exist.
#[derive(Debug, Default)]
pub struct DimensionResolver {
    states: HashMap<String, i32>,
    cities: HashMap<(i32, String), i32>,
    journal: Vec<CacheKey>,
    hits: u64,
    misses: u64,
}

impl DimensionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// State id for a resolved state, inserting the row if missing.
    pub async fn resolve_state(
        &mut self,
        conn: &mut SqliteConn,
        state: &StateRef,
    ) -> Result<i32, DbError> {
        if let Some(id) = self.states.get(&state.abbreviation) {
            self.hits += 1;
            return Ok(*id);
        }
        self.misses += 1;

        let now = now_rfc3339();
        let slug = slugify(&state.name);
        let id = ensure_state(
            conn,
            &NewState {
                abbreviation: &state.abbreviation,
                name: &state.name,
                slug: &slug,
                listing_count: 0,
                created_at: &now,
            },
        )
        .await?;

        self.states.insert(state.abbreviation.clone(), id);
        self.journal.push(CacheKey::State(state.abbreviation.clone()));
        Ok(id)
    }

    /// City id within a state, inserting the row if missing.
    pub async fn resolve_city(
        &mut self,
        conn: &mut SqliteConn,
        state_id: i32,
        name: &str,
        slug: &str,
    ) -> Result<i32, DbError> {
        let key = (state_id, slug.to_string());
        if let Some(id) = self.cities.get(&key) {
            self.hits += 1;
            return Ok(*id);
        }
        self.misses += 1;

        let now = now_rfc3339();
        let id = ensure_city(
            conn,
            &NewCity {
                state_id,
                name,
                slug,
                listing_count: 0,
                created_at: &now,
            },
        )
        .await?;

        self.cities.insert(key, id);
        self.journal.push(CacheKey::City(state_id, slug.to_string()));
        Ok(id)
    }

    /// Journal position to roll back to.
    pub fn mark(&self) -> usize {
        self.journal.len()
    }

    /// Forget every entry cached since `mark`.
    pub fn rollback_to(&mut self, mark: usize) {
        if mark >= self.journal.len() {
            return;
        }
        for key in self.journal.drain(mark..) {
            match key {
                CacheKey::State(abbr) => {
                    self.states.remove(&abbr);
                }
                CacheKey::City(state_id, slug) => {
                    self.cities.remove(&(state_id, slug));
                }
            }
        }
    }

    /// Make every cached entry permanent (after a commit).
    pub fn commit(&mut self) {
        self.journal.clear();
    }

    /// (cache hits, cache misses) so far.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    pub fn cached_states(&self) -> usize {
        self.states.len()
    }

    pub fn cached_cities(&self) -> usize {
        self.cities.len()
    }
}
