//! Listing fact rows.

use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::models::{ListingRow, NewListing};
use super::now_rfc3339;
use super::pool::{DbError, SqliteConn, SqlitePool};
use crate::models::{Coordinates, GeocodeCandidate};
use crate::schema::{cities, listings, states};

/// Insert a listing unless its slug already exists. Returns rows inserted.
pub async fn insert_ignore_by_slug(
    conn: &mut SqliteConn,
    listing: &NewListing,
) -> Result<usize, DbError> {
    diesel::insert_into(listings::table)
        .values(listing)
        .on_conflict(listings::slug)
        .do_nothing()
        .execute(conn)
        .await
}

/// Insert a listing unless its (city, name, address) key already exists.
pub async fn insert_ignore_by_natural_key(
    conn: &mut SqliteConn,
    listing: &NewListing,
) -> Result<usize, DbError> {
    diesel::insert_into(listings::table)
        .values(listing)
        .on_conflict((listings::city_id, listings::name, listings::address))
        .do_nothing()
        .execute(conn)
        .await
}

pub async fn find_id_by_slug(conn: &mut SqliteConn, slug: &str) -> Result<Option<i32>, DbError> {
    listings::table
        .filter(listings::slug.eq(slug))
        .select(listings::id)
        .first::<i32>(conn)
        .await
        .optional()
}

pub async fn find_id_by_natural_key(
    conn: &mut SqliteConn,
    city_id: i32,
    name: &str,
    address: &str,
) -> Result<Option<i32>, DbError> {
    listings::table
        .filter(listings::city_id.eq(city_id))
        .filter(listings::name.eq(name))
        .filter(listings::address.eq(address))
        .select(listings::id)
        .first::<i32>(conn)
        .await
        .optional()
}

/// Repository for listing reads and enrichment updates.
#[derive(Clone)]
pub struct ListingRepository {
    pool: SqlitePool,
}

impl ListingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64, DbError> {
        let mut conn = self.pool.get().await?;
        listings::table.select(count_star()).first(&mut conn).await
    }

    /// Count listings still carrying defaulted coordinates.
    pub async fn count_approximate(&self) -> Result<i64, DbError> {
        let mut conn = self.pool.get().await?;
        listings::table
            .filter(listings::coordinates_approximate.eq(true))
            .select(count_star())
            .first(&mut conn)
            .await
    }

    /// Get a listing by slug.
    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<ListingRow>, DbError> {
        let mut conn = self.pool.get().await?;
        listings::table
            .filter(listings::slug.eq(slug))
            .select(ListingRow::as_select())
            .first(&mut conn)
            .await
            .optional()
    }

    /// All listings in insertion order.
    pub async fn all(&self) -> Result<Vec<ListingRow>, DbError> {
        let mut conn = self.pool.get().await?;
        listings::table
            .order(listings::id.asc())
            .select(ListingRow::as_select())
            .load(&mut conn)
            .await
    }

    /// Listings with approximate coordinates, oldest first.
    pub async fn geocode_candidates(&self, limit: usize) -> Result<Vec<GeocodeCandidate>, DbError> {
        let mut conn = self.pool.get().await?;

        let rows = listings::table
            .inner_join(cities::table.inner_join(states::table))
            .filter(listings::coordinates_approximate.eq(true))
            .order(listings::id.asc())
            .limit(limit as i64)
            .select((
                listings::id,
                listings::name,
                listings::address,
                cities::name,
                states::abbreviation,
                listings::zip,
            ))
            .load::<(i32, String, String, String, String, String)>(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, address, city, state, zip)| GeocodeCandidate {
                id,
                name,
                address,
                city,
                state,
                zip,
            })
            .collect())
    }

    /// Replace a listing's coordinates with geocoded ones.
    ///
    /// Touches only the coordinate columns and `updated_at`.
    pub async fn update_coordinates(&self, id: i32, coords: Coordinates) -> Result<bool, DbError> {
        let mut conn = self.pool.get().await?;
        let now = now_rfc3339();

        let rows = diesel::update(listings::table.find(id))
            .set((
                listings::latitude.eq(coords.latitude),
                listings::longitude.eq(coords.longitude),
                listings::coordinates_approximate.eq(false),
                listings::updated_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?;

        Ok(rows > 0)
    }
}
