//! Raw record to canonical record.
//!
//! Normalization is pure: the same raw record and configuration always give
//! the same canonical record, including the slug and premium score. That is
//! what makes re-runs and resumes idempotent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::lookups::{StateLookup, US_CENTER};
use super::slug::{disambiguation_suffix, listing_slug, slugify};
use crate::models::{CanonicalRecord, Coordinates, FeatureFlags, SourceRecord};

pub const DEFAULT_ADDRESS: &str = "Address not provided";
pub const DEFAULT_PHONE: &str = "Phone not provided";
pub const DEFAULT_HOURS: &str = "Call for hours";
pub const DEFAULT_RATING: f64 = 0.0;

/// Highest rating a source may carry.
const MAX_RATING: f64 = 5.0;

/// Reasons a raw record cannot be normalized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

/// Values substituted for missing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerDefaults {
    pub address: String,
    pub phone: String,
    pub hours: String,
    pub rating: f64,
}

impl Default for NormalizerDefaults {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            phone: DEFAULT_PHONE.to_string(),
            hours: DEFAULT_HOURS.to_string(),
            rating: DEFAULT_RATING,
        }
    }
}

/// Premium score weights and thresholds.
///
/// The score is `base` plus points for rating, reviews, services and
/// amenities, clamped to 0..=100. Each term is non-decreasing in its input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub base: u32,
    /// Points per rating star.
    pub rating_weight: f64,
    /// Reviews needed for one point.
    pub reviews_per_point: u32,
    pub max_review_points: u32,
    pub points_per_service: u32,
    pub max_service_points: u32,
    pub points_per_feature: u32,
    pub premium_threshold: u8,
    pub featured_threshold: u8,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base: 10,
            rating_weight: 8.0,
            reviews_per_point: 20,
            max_review_points: 25,
            points_per_service: 3,
            max_service_points: 15,
            points_per_feature: 2,
            premium_threshold: 70,
            featured_threshold: 85,
        }
    }
}

impl ScoringConfig {
    /// Deterministic 0..=100 score.
    pub fn score(
        &self,
        rating: f64,
        review_count: i32,
        service_count: usize,
        features: &FeatureFlags,
    ) -> u8 {
        let rating = if rating.is_finite() {
            rating.clamp(0.0, MAX_RATING)
        } else {
            0.0
        };
        let rating_points = (rating * self.rating_weight).floor().max(0.0) as u32;

        let reviews = review_count.max(0) as u32;
        let review_points = (reviews / self.reviews_per_point.max(1)).min(self.max_review_points);

        let service_points = (service_count as u32)
            .saturating_mul(self.points_per_service)
            .min(self.max_service_points);

        let feature_points = features.count().saturating_mul(self.points_per_feature);

        let total = self
            .base
            .saturating_add(rating_points)
            .saturating_add(review_points)
            .saturating_add(service_points)
            .saturating_add(feature_points);
        total.min(100) as u8
    }
}

/// Case-insensitive substring triggers for each amenity.
const OPEN_24_TRIGGERS: &[&str] = &["24 hour", "24/7", "24hrs", "24 hrs", "open 24"];
const WIFI_TRIGGERS: &[&str] = &["wifi", "wi-fi", "wireless internet"];
const PARKING_TRIGGERS: &[&str] = &["parking"];
const CARD_TRIGGERS: &[&str] = &[
    "credit card",
    "debit card",
    "cards accepted",
    "accepts cards",
    "card payment",
    "card-operated",
];
const WASH_FOLD_TRIGGERS: &[&str] = &[
    "wash and fold",
    "wash & fold",
    "wash-and-fold",
    "wash n fold",
    "drop-off laundry",
    "drop off laundry",
];
const DRY_CLEANING_TRIGGERS: &[&str] = &["dry clean"];
const ATTENDANT_TRIGGERS: &[&str] = &["attendant", "staff on site", "on-site staff"];

/// Derive amenity flags from services and hours text.
pub fn detect_features(services: &str, hours: &str) -> FeatureFlags {
    let haystack = format!("{} {}", services, hours).to_lowercase();
    let any = |triggers: &[&str]| triggers.iter().any(|t| haystack.contains(t));
    FeatureFlags {
        open_24_hours: any(OPEN_24_TRIGGERS),
        has_wifi: any(WIFI_TRIGGERS),
        has_parking: any(PARKING_TRIGGERS),
        accepts_cards: any(CARD_TRIGGERS),
        wash_and_fold: any(WASH_FOLD_TRIGGERS),
        dry_cleaning: any(DRY_CLEANING_TRIGGERS),
        has_attendant: any(ATTENDANT_TRIGGERS),
    }
}

/// Split a free-text services field into distinct entries.
pub fn split_services(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in raw.split([',', ';', '|', '\n']) {
        let item = collapse_whitespace(part);
        if item.is_empty() {
            continue;
        }
        if !out.iter().any(|s| s.eq_ignore_ascii_case(&item)) {
            out.push(item);
        }
    }
    out
}

/// Turns raw rows into canonical records.
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    lookup: &'static StateLookup,
    defaults: NormalizerDefaults,
    scoring: ScoringConfig,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(
            StateLookup::us(),
            NormalizerDefaults::default(),
            ScoringConfig::default(),
        )
    }
}

impl RecordNormalizer {
    pub fn new(
        lookup: &'static StateLookup,
        defaults: NormalizerDefaults,
        scoring: ScoringConfig,
    ) -> Self {
        Self {
            lookup,
            defaults,
            scoring,
        }
    }

    pub fn lookup(&self) -> &StateLookup {
        self.lookup
    }

    /// Normalize one raw record.
    pub fn normalize(&self, raw: &SourceRecord) -> Result<CanonicalRecord, NormalizeError> {
        let name = required(&raw.name, "name")?;
        let city = required(&raw.city, "city")?;
        let raw_state = required(&raw.state, "state")?;
        let state = self.lookup.resolve(&raw_state);

        let address = present(&raw.address).unwrap_or_else(|| self.defaults.address.clone());
        let phone = present(&raw.phone).unwrap_or_else(|| self.defaults.phone.clone());
        let hours = present(&raw.hours).unwrap_or_else(|| self.defaults.hours.clone());
        let zip = present(&raw.zip).map(|z| normalize_zip(&z)).unwrap_or_default();
        let website = present(&raw.website).and_then(|w| normalize_website(&w));

        let (coordinates, coordinates_approximate) = match parse_coordinates(raw) {
            Some(coords) => (coords, false),
            None => (
                self.lookup
                    .centroid(&state.abbreviation)
                    .unwrap_or(US_CENTER),
                true,
            ),
        };

        let rating = raw
            .rating
            .as_deref()
            .and_then(parse_rating)
            .unwrap_or(self.defaults.rating);
        let review_count = raw.review_count.as_deref().map(parse_count).unwrap_or(0);

        let services_text = raw.services.as_deref().unwrap_or("");
        let services = split_services(services_text);
        let features = detect_features(services_text, raw.hours.as_deref().unwrap_or(""));

        let premium_score = self
            .scoring
            .score(rating, review_count, services.len(), &features);

        let suffix = disambiguation_suffix(&[
            name.as_str(),
            address.as_str(),
            city.as_str(),
            state.abbreviation.as_str(),
            zip.as_str(),
        ]);
        let slug = listing_slug(&name, &city, &state.abbreviation, &suffix);

        Ok(CanonicalRecord {
            city_slug: slugify(&city),
            name,
            address,
            city,
            zip,
            phone,
            website,
            coordinates,
            coordinates_approximate,
            rating,
            review_count,
            hours,
            services,
            features,
            slug,
            is_premium: premium_score >= self.scoring.premium_threshold,
            is_featured: premium_score >= self.scoring.featured_threshold,
            premium_score,
            state,
        })
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trimmed, whitespace-collapsed value, or None when blank.
fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(collapse_whitespace)
        .filter(|v| !v.is_empty())
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, NormalizeError> {
    present(value).ok_or(NormalizeError::MissingField(field))
}

/// Keep ZIP+4 as is; restore leading zeros spreadsheets strip from 5-digit ZIPs.
fn normalize_zip(zip: &str) -> String {
    let zip = zip.trim_end_matches(".0");
    if zip.len() < 5 && !zip.is_empty() && zip.chars().all(|c| c.is_ascii_digit()) {
        format!("{zip:0>5}")
    } else {
        zip.to_string()
    }
}

fn normalize_website(raw: &str) -> Option<String> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    match url::Url::parse(&candidate) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
            Some(url.to_string())
        }
        _ => None,
    }
}

fn parse_coordinates(raw: &SourceRecord) -> Option<Coordinates> {
    let lat = raw.latitude.as_deref()?.trim().parse::<f64>().ok()?;
    let lng = raw.longitude.as_deref()?.trim().parse::<f64>().ok()?;
    let coords = Coordinates::new(lat, lng);
    coords.is_plausible().then_some(coords)
}

fn parse_rating(raw: &str) -> Option<f64> {
    let rating = raw.trim().replace(',', ".").parse::<f64>().ok()?;
    rating.is_finite().then(|| rating.clamp(0.0, MAX_RATING))
}

/// Parse "1,234" or "1234.0"; anything unparsable counts as zero.
fn parse_count(raw: &str) -> i32 {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.min(i32::MAX as f64) as i32)
        .unwrap_or(0)
}
