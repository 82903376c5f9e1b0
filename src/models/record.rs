//! Source and canonical record models.
//!
//! A [`SourceRecord`] is one raw row as read from the input dataset. The
//! normalizer turns it into a [`CanonicalRecord`], which carries everything
//! needed to write the listing and its dimension rows.

use serde::{Deserialize, Serialize};

/// One raw input row. Every attribute is an optional string; identity is
/// the row's position in the source, not anything inside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub services: Option<String>,
    pub hours: Option<String>,
}

impl SourceRecord {
    /// Minimal record with the three attributes a listing cannot do without.
    pub fn new(name: &str, city: &str, state: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            city: Some(city.to_string()),
            state: Some(state.to_string()),
            ..Default::default()
        }
    }

    /// Short natural-key label used in error logs.
    pub fn label(&self) -> String {
        let part = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").to_string();
        format!(
            "{} | {} | {}",
            part(&self.name),
            part(&self.city),
            part(&self.state)
        )
    }
}

/// A state as resolved by the lookup table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRef {
    pub abbreviation: String,
    pub name: String,
    /// False when the raw value matched nothing and was passed through.
    pub known: bool,
}

/// Latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether the pair lies inside the valid lat/lng ranges and is not the
    /// null island placeholder many exports emit for missing values.
    pub fn is_plausible(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

/// Boolean amenities derived from free-text services and hours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub open_24_hours: bool,
    pub has_wifi: bool,
    pub has_parking: bool,
    pub accepts_cards: bool,
    pub wash_and_fold: bool,
    pub dry_cleaning: bool,
    pub has_attendant: bool,
}

impl FeatureFlags {
    /// Number of flags that are set.
    pub fn count(&self) -> u32 {
        [
            self.open_24_hours,
            self.has_wifi,
            self.has_parking,
            self.accepts_cards,
            self.wash_and_fold,
            self.dry_cleaning,
            self.has_attendant,
        ]
        .iter()
        .filter(|f| **f)
        .count() as u32
    }
}

/// A fully normalized listing, ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub name: String,
    pub address: String,
    pub city: String,
    pub city_slug: String,
    pub state: StateRef,
    pub zip: String,
    pub phone: String,
    pub website: Option<String>,
    pub coordinates: Coordinates,
    /// Coordinates came from a default rather than the source row.
    pub coordinates_approximate: bool,
    pub rating: f64,
    pub review_count: i32,
    pub hours: String,
    pub services: Vec<String>,
    pub features: FeatureFlags,
    pub slug: String,
    pub premium_score: u8,
    pub is_premium: bool,
    pub is_featured: bool,
}

impl CanonicalRecord {
    /// The (city, name, address) natural key as a display string.
    pub fn natural_key(&self) -> String {
        format!(
            "{} | {}, {} | {}",
            self.name, self.city, self.state.abbreviation, self.address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_count() {
        let flags = FeatureFlags {
            open_24_hours: true,
            has_wifi: true,
            ..Default::default()
        };
        assert_eq!(flags.count(), 2);
        assert_eq!(FeatureFlags::default().count(), 0);
    }

    #[test]
    fn test_coordinates_plausibility() {
        assert!(Coordinates::new(39.74, -104.99).is_plausible());
        assert!(!Coordinates::new(0.0, 0.0).is_plausible());
        assert!(!Coordinates::new(91.0, 10.0).is_plausible());
        assert!(!Coordinates::new(10.0, -181.0).is_plausible());
    }

    #[test]
    fn test_label_trims_and_tolerates_missing() {
        let mut record = SourceRecord::new(" Suds ", "Denver", "CO");
        record.city = None;
        assert_eq!(record.label(), "Suds |  | CO");
    }
}
