//! Header name to field mapping.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::SourceError;
use crate::models::SourceRecord;

/// A source record attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Address,
    City,
    State,
    Zip,
    Phone,
    Website,
    Latitude,
    Longitude,
    Rating,
    ReviewCount,
    Services,
    Hours,
}

impl Field {
    pub const ALL: [Field; 13] = [
        Field::Name,
        Field::Address,
        Field::City,
        Field::State,
        Field::Zip,
        Field::Phone,
        Field::Website,
        Field::Latitude,
        Field::Longitude,
        Field::Rating,
        Field::ReviewCount,
        Field::Services,
        Field::Hours,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Address => "address",
            Self::City => "city",
            Self::State => "state",
            Self::Zip => "zip",
            Self::Phone => "phone",
            Self::Website => "website",
            Self::Latitude => "latitude",
            Self::Longitude => "longitude",
            Self::Rating => "rating",
            Self::ReviewCount => "review_count",
            Self::Services => "services",
            Self::Hours => "hours",
        }
    }

    /// Fields without which no record in the source could be imported.
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Name | Self::City | Self::State)
    }

    fn slot<'a>(&self, record: &'a mut SourceRecord) -> &'a mut Option<String> {
        match self {
            Self::Name => &mut record.name,
            Self::Address => &mut record.address,
            Self::City => &mut record.city,
            Self::State => &mut record.state,
            Self::Zip => &mut record.zip,
            Self::Phone => &mut record.phone,
            Self::Website => &mut record.website,
            Self::Latitude => &mut record.latitude,
            Self::Longitude => &mut record.longitude,
            Self::Rating => &mut record.rating,
            Self::ReviewCount => &mut record.review_count,
            Self::Services => &mut record.services,
            Self::Hours => &mut record.hours,
        }
    }

    /// Store a value, treating blank strings as absent.
    pub fn assign(&self, record: &mut SourceRecord, value: &str) {
        let value = value.trim();
        if !value.is_empty() {
            *self.slot(record) = Some(value.to_string());
        }
    }
}

/// Candidate header names per field, tried in order, case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub name: Vec<String>,
    pub address: Vec<String>,
    pub city: Vec<String>,
    pub state: Vec<String>,
    pub zip: Vec<String>,
    pub phone: Vec<String>,
    pub website: Vec<String>,
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    pub rating: Vec<String>,
    pub review_count: Vec<String>,
    pub services: Vec<String>,
    pub hours: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            name: names(&["name", "business name", "title"]),
            address: names(&["address", "street", "full address", "street address"]),
            city: names(&["city", "town"]),
            state: names(&["state", "state code", "us state", "province"]),
            zip: names(&["zip", "postal code", "zipcode", "zip code"]),
            phone: names(&["phone", "phone number", "telephone"]),
            website: names(&["website", "site", "url"]),
            latitude: names(&["latitude", "lat"]),
            longitude: names(&["longitude", "lng", "lon", "long"]),
            rating: names(&["rating", "stars"]),
            review_count: names(&["reviews", "review count", "reviews count", "user ratings total"]),
            services: names(&["services", "amenities", "subtypes", "category"]),
            hours: names(&["hours", "working hours", "opening hours"]),
        }
    }
}

impl ColumnMapping {
    pub fn candidates(&self, field: Field) -> &[String] {
        match field {
            Field::Name => &self.name,
            Field::Address => &self.address,
            Field::City => &self.city,
            Field::State => &self.state,
            Field::Zip => &self.zip,
            Field::Phone => &self.phone,
            Field::Website => &self.website,
            Field::Latitude => &self.latitude,
            Field::Longitude => &self.longitude,
            Field::Rating => &self.rating,
            Field::ReviewCount => &self.review_count,
            Field::Services => &self.services,
            Field::Hours => &self.hours,
        }
    }
}

/// Header comparison key: lowercase with `_`/`-` read as spaces.
pub(crate) fn header_key(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Column positions resolved against a concrete header row.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldIndex {
    columns: Vec<(Field, usize)>,
}

impl FieldIndex {
    /// Resolve each field to the first candidate present in `headers`.
    pub fn from_headers<'h>(
        headers: impl IntoIterator<Item = &'h str>,
        mapping: &ColumnMapping,
        path: &Path,
    ) -> Result<Self, SourceError> {
        let keys: Vec<String> = headers.into_iter().map(header_key).collect();
        let mut columns = Vec::new();

        for field in Field::ALL {
            let candidates = mapping.candidates(field);
            let position = candidates.iter().find_map(|candidate| {
                let wanted = header_key(candidate);
                keys.iter().position(|k| *k == wanted)
            });

            match position {
                Some(idx) => columns.push((field, idx)),
                None if field.is_required() => {
                    return Err(SourceError::MissingColumn {
                        path: path.to_path_buf(),
                        field: field.as_str(),
                        candidates: candidates.join(", "),
                    })
                }
                None => {
                    tracing::debug!("No column for optional field '{}'", field.as_str());
                }
            }
        }

        Ok(Self { columns })
    }

    /// Build a record from a row accessor.
    pub fn extract<'r, F>(&self, get: F) -> SourceRecord
    where
        F: Fn(usize) -> Option<std::borrow::Cow<'r, str>>,
    {
        let mut record = SourceRecord::default();
        for (field, idx) in &self.columns {
            if let Some(value) = get(*idx) {
                field.assign(&mut record, &value);
            }
        }
        record
    }

    pub fn column(&self, field: Field) -> Option<usize> {
        self.columns
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, idx)| *idx)
    }
}
