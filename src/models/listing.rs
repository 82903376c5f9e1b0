//! Read-side views over stored listings and dimensions.

use serde::Serialize;

/// Per-state totals shown by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSummary {
    pub abbreviation: String,
    pub name: String,
    pub listing_count: i32,
    pub city_count: i64,
}

/// A listing whose coordinates were defaulted and can be refined by geocoding.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeCandidate {
    pub id: i32,
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl GeocodeCandidate {
    /// Free-form query string, e.g. "123 Main St, Denver, CO 80202".
    pub fn query(&self) -> String {
        let mut parts = Vec::new();
        if !self.address.is_empty() {
            parts.push(self.address.clone());
        }
        parts.push(self.city.clone());
        let state_zip = format!("{} {}", self.state, self.zip);
        parts.push(state_zip.trim().to_string());
        parts.join(", ")
    }
}
