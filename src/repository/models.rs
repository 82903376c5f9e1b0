//! Diesel ORM models for database tables.

use diesel::prelude::*;

use crate::models::CanonicalRecord;
use crate::schema;

/// State record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::states)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct StateRow {
    pub id: i32,
    pub abbreviation: String,
    pub name: String,
    pub slug: String,
    pub listing_count: i32,
    pub created_at: String,
}

/// New state for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::states)]
pub struct NewState<'a> {
    pub abbreviation: &'a str,
    pub name: &'a str,
    pub slug: &'a str,
    pub listing_count: i32,
    pub created_at: &'a str,
}

/// City record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::cities)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CityRow {
    pub id: i32,
    pub state_id: i32,
    pub name: String,
    pub slug: String,
    pub listing_count: i32,
    pub created_at: String,
}

/// New city for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::cities)]
pub struct NewCity<'a> {
    pub state_id: i32,
    pub name: &'a str,
    pub slug: &'a str,
    pub listing_count: i32,
    pub created_at: &'a str,
}

/// Listing record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::listings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ListingRow {
    pub id: i32,
    pub slug: String,
    pub name: String,
    pub address: String,
    pub city_id: i32,
    pub state_id: i32,
    pub zip: String,
    pub phone: String,
    pub website: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub coordinates_approximate: bool,
    pub rating: f64,
    pub review_count: i32,
    pub hours: String,
    pub services: String,
    pub open_24_hours: bool,
    pub has_wifi: bool,
    pub has_parking: bool,
    pub accepts_cards: bool,
    pub wash_and_fold: bool,
    pub dry_cleaning: bool,
    pub has_attendant: bool,
    pub premium_score: i32,
    pub is_premium: bool,
    pub is_featured: bool,
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,
    pub source_offset: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl ListingRow {
    /// Decoded services list.
    pub fn services(&self) -> Vec<String> {
        serde_json::from_str(&self.services).unwrap_or_default()
    }
}

/// New listing for insertion.
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = schema::listings)]
pub struct NewListing {
    pub slug: String,
    pub name: String,
    pub address: String,
    pub city_id: i32,
    pub state_id: i32,
    pub zip: String,
    pub phone: String,
    pub website: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub coordinates_approximate: bool,
    pub rating: f64,
    pub review_count: i32,
    pub hours: String,
    pub services: String,
    pub open_24_hours: bool,
    pub has_wifi: bool,
    pub has_parking: bool,
    pub accepts_cards: bool,
    pub wash_and_fold: bool,
    pub dry_cleaning: bool,
    pub has_attendant: bool,
    pub premium_score: i32,
    pub is_premium: bool,
    pub is_featured: bool,
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,
    pub source_offset: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl NewListing {
    /// Build the insert row for a canonical record whose dimensions are resolved.
    pub fn from_canonical(
        record: &CanonicalRecord,
        state_id: i32,
        city_id: i32,
        source_offset: u64,
        now: &str,
    ) -> Self {
        let flags = record.features;
        Self {
            slug: record.slug.clone(),
            name: record.name.clone(),
            address: record.address.clone(),
            city_id,
            state_id,
            zip: record.zip.clone(),
            phone: record.phone.clone(),
            website: record.website.clone(),
            latitude: record.coordinates.latitude,
            longitude: record.coordinates.longitude,
            coordinates_approximate: record.coordinates_approximate,
            rating: record.rating,
            review_count: record.review_count,
            hours: record.hours.clone(),
            services: serde_json::to_string(&record.services).unwrap_or_else(|_| "[]".to_string()),
            open_24_hours: flags.open_24_hours,
            has_wifi: flags.has_wifi,
            has_parking: flags.has_parking,
            accepts_cards: flags.accepts_cards,
            wash_and_fold: flags.wash_and_fold,
            dry_cleaning: flags.dry_cleaning,
            has_attendant: flags.has_attendant,
            premium_score: i32::from(record.premium_score),
            is_premium: record.is_premium,
            is_featured: record.is_featured,
            seo_title: None,
            seo_description: None,
            source_offset: source_offset as i64,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }
}

/// Checkpoint record from the database.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::import_checkpoints)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CheckpointRow {
    pub run_key: String,
    pub data: String,
    pub updated_at: String,
}
