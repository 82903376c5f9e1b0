//! Idempotent listing writes.

use serde::{Deserialize, Serialize};

use crate::repository::dimension::increment_counts;
use crate::repository::listing::{
    find_id_by_natural_key, find_id_by_slug, insert_ignore_by_natural_key, insert_ignore_by_slug,
};
use crate::repository::models::NewListing;
use crate::repository::{DbError, SqliteConn};

/// Which unique key makes a re-inserted listing a no-op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyKey {
    /// The deterministic listing slug.
    #[default]
    Slug,
    /// (city, name, address).
    Natural,
}

impl std::str::FromStr for IdempotencyKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slug" => Ok(Self::Slug),
            "natural" => Ok(Self::Natural),
            other => Err(format!("unknown idempotency key '{other}' (expected slug or natural)")),
        }
    }
}

/// Result of one upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// False when the key already existed and nothing was written.
    pub inserted: bool,
    pub id: Option<i32>,
}

/// Writes listings with insert-or-ignore semantics.
///
/// An existing row with the same key is left untouched; re-importing a
/// listing never updates or duplicates it. Fresh inserts bump the owning
/// state and city counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertSink {
    key: IdempotencyKey,
}

impl UpsertSink {
    pub fn new(key: IdempotencyKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> IdempotencyKey {
        self.key
    }

    pub async fn upsert(
        &self,
        conn: &mut SqliteConn,
        listing: &NewListing,
    ) -> Result<UpsertOutcome, DbError> {
        let rows = match self.key {
            IdempotencyKey::Slug => insert_ignore_by_slug(conn, listing).await?,
            IdempotencyKey::Natural => insert_ignore_by_natural_key(conn, listing).await?,
        };
        let inserted = rows > 0;

        if inserted {
            increment_counts(conn, listing.state_id, listing.city_id).await?;
        }

        let id = match self.key {
            IdempotencyKey::Slug => find_id_by_slug(conn, &listing.slug).await?,
            IdempotencyKey::Natural => {
                find_id_by_natural_key(conn, listing.city_id, &listing.name, &listing.address)
                    .await?
            }
        };

        Ok(UpsertOutcome { inserted, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::normalize::RecordNormalizer;
    use crate::import::resolver::DimensionResolver;
    use crate::models::SourceRecord;
    use crate::repository::test_support::setup_test_db;

    async fn prepare(conn: &mut SqliteConn, raw: &SourceRecord) -> NewListing {
        let record = RecordNormalizer::default().normalize(raw).unwrap();
        let mut resolver = DimensionResolver::new();
        let state_id = resolver.resolve_state(conn, &record.state).await.unwrap();
        let city_id = resolver
            .resolve_city(conn, state_id, &record.city, &record.city_slug)
            .await
            .unwrap();
        NewListing::from_canonical(&record, state_id, city_id, 0, "2024-01-01T00:00:00Z")
    }

    #[tokio::test]
    async fn test_second_insert_is_noop() {
        let (ctx, _dir) = setup_test_db().await;
        let mut conn = ctx.connect().await.unwrap();
        let sink = UpsertSink::default();

        let listing = prepare(&mut conn, &SourceRecord::new("Suds", "Denver", "CO")).await;
        let first = sink.upsert(&mut conn, &listing).await.unwrap();
        assert!(first.inserted);
        assert!(first.id.is_some());

        let mut changed = listing.clone();
        changed.phone = "555-0100".to_string();
        let second = sink.upsert(&mut conn, &changed).await.unwrap();
        assert!(!second.inserted);
        assert_eq!(second.id, first.id);

        let stored = ctx.listings().get_by_slug(&listing.slug).await.unwrap().unwrap();
        assert_eq!(stored.phone, listing.phone);
        assert_eq!(ctx.listings().count().await.unwrap(), 1);

        let state = ctx.dimensions().get_state("CO").await.unwrap().unwrap();
        assert_eq!(state.listing_count, 1);
    }

    #[tokio::test]
    async fn test_natural_key_mode() {
        let (ctx, _dir) = setup_test_db().await;
        let mut conn = ctx.connect().await.unwrap();
        let sink = UpsertSink::new(IdempotencyKey::Natural);

        let listing = prepare(&mut conn, &SourceRecord::new("Suds", "Denver", "CO")).await;
        assert!(sink.upsert(&mut conn, &listing).await.unwrap().inserted);

        // Same natural key under a different slug is still a duplicate.
        let mut renamed = listing.clone();
        renamed.slug = "suds-denver-co-ffffffff".to_string();
        let outcome = sink.upsert(&mut conn, &renamed).await.unwrap();
        assert!(!outcome.inserted);
        assert_eq!(ctx.listings().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_slug_mode_rejects_natural_key_collision() {
        let (ctx, _dir) = setup_test_db().await;
        let mut conn = ctx.connect().await.unwrap();
        let sink = UpsertSink::default();

        let listing = prepare(&mut conn, &SourceRecord::new("Suds", "Denver", "CO")).await;
        sink.upsert(&mut conn, &listing).await.unwrap();

        let mut clash = listing.clone();
        clash.slug = "another-slug".to_string();
        let err = sink.upsert(&mut conn, &clash).await.unwrap_err();
        assert!(crate::repository::util::is_unique_violation(&err));
    }

    #[test]
    fn test_key_from_str() {
        assert_eq!("Natural".parse::<IdempotencyKey>(), Ok(IdempotencyKey::Natural));
        assert!("id".parse::<IdempotencyKey>().is_err());
    }
}
