//! State and city dimension rows.
//!
//! Dimension rows are created lazily the first time a listing references
//! them. The `ensure_*` functions run inside the caller's transaction and
//! follow an insert-ignore-then-fetch pattern so concurrent writers never
//! produce duplicates.

use std::collections::HashMap;

use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use diesel_async::RunQueryDsl;

use super::models::{CityRow, NewCity, NewState, StateRow};
use super::pool::{DbError, SqliteConn, SqlitePool};
use super::util::is_unique_violation;
use crate::models::StateSummary;
use crate::schema::{cities, states};

const RECOUNT_STATE_SQL: &str = "UPDATE states SET listing_count = \
     (SELECT COUNT(*) FROM listings WHERE listings.state_id = states.id) WHERE id = ?";
const RECOUNT_CITY_SQL: &str = "UPDATE cities SET listing_count = \
     (SELECT COUNT(*) FROM listings WHERE listings.city_id = cities.id) WHERE id = ?";
const RECOUNT_ALL_SQL: &str = "\
    UPDATE states SET listing_count = \
        (SELECT COUNT(*) FROM listings WHERE listings.state_id = states.id); \
    UPDATE cities SET listing_count = \
        (SELECT COUNT(*) FROM listings WHERE listings.city_id = cities.id);";

/// Look up a state id by abbreviation.
pub async fn find_state_id(
    conn: &mut SqliteConn,
    abbreviation: &str,
) -> Result<Option<i32>, DbError> {
    states::table
        .filter(states::abbreviation.eq(abbreviation))
        .select(states::id)
        .first::<i32>(conn)
        .await
        .optional()
}

/// Look up a city id by its slug within a state.
pub async fn find_city_id(
    conn: &mut SqliteConn,
    state_id: i32,
    slug: &str,
) -> Result<Option<i32>, DbError> {
    cities::table
        .filter(cities::state_id.eq(state_id))
        .filter(cities::slug.eq(slug))
        .select(cities::id)
        .first::<i32>(conn)
        .await
        .optional()
}

/// Return the id of the state row, creating it if needed.
pub async fn ensure_state(conn: &mut SqliteConn, state: &NewState<'_>) -> Result<i32, DbError> {
    if let Some(id) = find_state_id(conn, state.abbreviation).await? {
        return Ok(id);
    }

    let inserted = diesel::insert_into(states::table)
        .values(state)
        .on_conflict(states::abbreviation)
        .do_nothing()
        .execute(conn)
        .await;

    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            tracing::debug!(
                "State {} insert raced another writer, refetching",
                state.abbreviation
            );
        }
        Err(e) => return Err(e),
    }

    find_state_id(conn, state.abbreviation)
        .await?
        .ok_or(DbError::NotFound)
}

/// Return the id of the city row, creating it if needed.
pub async fn ensure_city(conn: &mut SqliteConn, city: &NewCity<'_>) -> Result<i32, DbError> {
    if let Some(id) = find_city_id(conn, city.state_id, city.slug).await? {
        return Ok(id);
    }

    let inserted = diesel::insert_into(cities::table)
        .values(city)
        .on_conflict((cities::state_id, cities::slug))
        .do_nothing()
        .execute(conn)
        .await;

    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            tracing::debug!("City {} insert raced another writer, refetching", city.slug);
        }
        Err(e) => return Err(e),
    }

    find_city_id(conn, city.state_id, city.slug)
        .await?
        .ok_or(DbError::NotFound)
}

/// Bump the denormalized counts for a freshly inserted listing.
pub async fn increment_counts(
    conn: &mut SqliteConn,
    state_id: i32,
    city_id: i32,
) -> Result<(), DbError> {
    diesel::update(states::table.find(state_id))
        .set(states::listing_count.eq(states::listing_count + 1))
        .execute(conn)
        .await?;
    diesel::update(cities::table.find(city_id))
        .set(cities::listing_count.eq(cities::listing_count + 1))
        .execute(conn)
        .await?;
    Ok(())
}

/// Recompute counts for the given dimension rows from the listings table.
pub async fn recount(
    conn: &mut SqliteConn,
    state_ids: &[i32],
    city_ids: &[i32],
) -> Result<(), DbError> {
    for id in state_ids {
        diesel::sql_query(RECOUNT_STATE_SQL)
            .bind::<Integer, _>(*id)
            .execute(conn)
            .await?;
    }
    for id in city_ids {
        diesel::sql_query(RECOUNT_CITY_SQL)
            .bind::<Integer, _>(*id)
            .execute(conn)
            .await?;
    }
    Ok(())
}

/// Repository for dimension reads and maintenance outside an import batch.
#[derive(Clone)]
pub struct DimensionRepository {
    pool: SqlitePool,
}

impl DimensionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Recompute every state and city count from the listings table.
    pub async fn recount_all(&self) -> Result<(), DbError> {
        use diesel_async::SimpleAsyncConnection;

        let mut conn = self.pool.get().await?;
        conn.batch_execute(RECOUNT_ALL_SQL).await
    }

    pub async fn count_states(&self) -> Result<i64, DbError> {
        let mut conn = self.pool.get().await?;
        states::table.select(count_star()).first(&mut conn).await
    }

    pub async fn count_cities(&self) -> Result<i64, DbError> {
        let mut conn = self.pool.get().await?;
        cities::table.select(count_star()).first(&mut conn).await
    }

    /// Get a state by abbreviation.
    pub async fn get_state(&self, abbreviation: &str) -> Result<Option<StateRow>, DbError> {
        let mut conn = self.pool.get().await?;
        states::table
            .filter(states::abbreviation.eq(abbreviation))
            .select(StateRow::as_select())
            .first(&mut conn)
            .await
            .optional()
    }

    /// Get all cities of a state, ordered by name.
    pub async fn cities_in_state(&self, state_id: i32) -> Result<Vec<CityRow>, DbError> {
        let mut conn = self.pool.get().await?;
        cities::table
            .filter(cities::state_id.eq(state_id))
            .order(cities::name.asc())
            .select(CityRow::as_select())
            .load(&mut conn)
            .await
    }

    /// Per-state listing and city totals, largest first.
    pub async fn state_summaries(&self) -> Result<Vec<StateSummary>, DbError> {
        let mut conn = self.pool.get().await?;

        let rows: Vec<StateRow> = states::table
            .order((states::listing_count.desc(), states::abbreviation.asc()))
            .select(StateRow::as_select())
            .load(&mut conn)
            .await?;

        let city_counts: HashMap<i32, i64> = cities::table
            .group_by(cities::state_id)
            .select((cities::state_id, count_star()))
            .load::<(i32, i64)>(&mut conn)
            .await?
            .into_iter()
            .collect();

        Ok(rows
            .into_iter()
            .map(|row| StateSummary {
                city_count: city_counts.get(&row.id).copied().unwrap_or(0),
                abbreviation: row.abbreviation,
                name: row.name,
                listing_count: row.listing_count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::now_rfc3339;
    use crate::repository::test_support::setup_test_db;

    fn colorado<'a>(now: &'a str) -> NewState<'a> {
        NewState {
            abbreviation: "CO",
            name: "Colorado",
            slug: "colorado",
            listing_count: 0,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_ensure_state_is_idempotent() {
        let (ctx, _dir) = setup_test_db().await;
        let mut conn = ctx.connect().await.unwrap();
        let now = now_rfc3339();

        let first = ensure_state(&mut conn, &colorado(&now)).await.unwrap();
        let second = ensure_state(&mut conn, &colorado(&now)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.dimensions().count_states().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ensure_city_scoped_by_state() {
        let (ctx, _dir) = setup_test_db().await;
        let mut conn = ctx.connect().await.unwrap();
        let now = now_rfc3339();

        let co = ensure_state(&mut conn, &colorado(&now)).await.unwrap();
        let tx = ensure_state(
            &mut conn,
            &NewState {
                abbreviation: "TX",
                name: "Texas",
                slug: "texas",
                listing_count: 0,
                created_at: &now,
            },
        )
        .await
        .unwrap();

        let city = |state_id| NewCity {
            state_id,
            name: "Aurora",
            slug: "aurora",
            listing_count: 0,
            created_at: &now,
        };
        let co_aurora = ensure_city(&mut conn, &city(co)).await.unwrap();
        let tx_aurora = ensure_city(&mut conn, &city(tx)).await.unwrap();
        let again = ensure_city(&mut conn, &city(co)).await.unwrap();

        assert_ne!(co_aurora, tx_aurora);
        assert_eq!(co_aurora, again);
        assert_eq!(ctx.dimensions().count_cities().await.unwrap(), 2);
        assert_eq!(ctx.dimensions().cities_in_state(co).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_city_requires_existing_state() {
        let (ctx, _dir) = setup_test_db().await;
        let mut conn = ctx.connect().await.unwrap();
        let now = now_rfc3339();

        let result = ensure_city(
            &mut conn,
            &NewCity {
                state_id: 999,
                name: "Nowhere",
                slug: "nowhere",
                listing_count: 0,
                created_at: &now,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_increment_then_recount() {
        let (ctx, _dir) = setup_test_db().await;
        let mut conn = ctx.connect().await.unwrap();
        let now = now_rfc3339();

        let state_id = ensure_state(&mut conn, &colorado(&now)).await.unwrap();
        let city_id = ensure_city(
            &mut conn,
            &NewCity {
                state_id,
                name: "Denver",
                slug: "denver",
                listing_count: 0,
                created_at: &now,
            },
        )
        .await
        .unwrap();

        increment_counts(&mut conn, state_id, city_id).await.unwrap();
        let state = ctx.dimensions().get_state("CO").await.unwrap().unwrap();
        assert_eq!(state.listing_count, 1);

        // No listings exist, so a recount brings the counts back to zero.
        recount(&mut conn, &[state_id], &[city_id]).await.unwrap();
        let state = ctx.dimensions().get_state("CO").await.unwrap().unwrap();
        assert_eq!(state.listing_count, 0);

        let summaries = ctx.dimensions().state_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].city_count, 1);
    }
}
