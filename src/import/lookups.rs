//! Static state lookup table.
//!
//! Maps two-letter postal abbreviations to full names (and back) and carries
//! an approximate centroid per state, used when a row has no coordinates.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::models::{Coordinates, StateRef};

/// Geographic center of the contiguous United States.
pub const US_CENTER: Coordinates = Coordinates {
    latitude: 39.8283,
    longitude: -98.5795,
};

/// One row of the lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub abbreviation: &'static str,
    pub name: &'static str,
    pub centroid: Coordinates,
}

const fn entry(abbreviation: &'static str, name: &'static str, lat: f64, lng: f64) -> StateEntry {
    StateEntry {
        abbreviation,
        name,
        centroid: Coordinates {
            latitude: lat,
            longitude: lng,
        },
    }
}

static US_STATES: [StateEntry; 52] = [
    entry("AL", "Alabama", 32.806671, -86.791130),
    entry("AK", "Alaska", 61.370716, -152.404419),
    entry("AZ", "Arizona", 33.729759, -111.431221),
    entry("AR", "Arkansas", 34.969704, -92.373123),
    entry("CA", "California", 36.116203, -119.681564),
    entry("CO", "Colorado", 39.059811, -105.311104),
    entry("CT", "Connecticut", 41.597782, -72.755371),
    entry("DE", "Delaware", 39.318523, -75.507141),
    entry("DC", "District of Columbia", 38.907200, -77.036900),
    entry("FL", "Florida", 27.766279, -81.686783),
    entry("GA", "Georgia", 33.040619, -83.643074),
    entry("HI", "Hawaii", 21.094318, -157.498337),
    entry("ID", "Idaho", 44.240459, -114.478828),
    entry("IL", "Illinois", 40.349457, -88.986137),
    entry("IN", "Indiana", 39.849426, -86.258278),
    entry("IA", "Iowa", 42.011539, -93.210526),
    entry("KS", "Kansas", 38.526600, -96.726486),
    entry("KY", "Kentucky", 37.668140, -84.670067),
    entry("LA", "Louisiana", 31.169546, -91.867805),
    entry("ME", "Maine", 44.693947, -69.381927),
    entry("MD", "Maryland", 39.063946, -76.802101),
    entry("MA", "Massachusetts", 42.230171, -71.530106),
    entry("MI", "Michigan", 43.326618, -84.536095),
    entry("MN", "Minnesota", 45.694454, -93.900192),
    entry("MS", "Mississippi", 32.741646, -89.678696),
    entry("MO", "Missouri", 38.456085, -92.288368),
    entry("MT", "Montana", 46.921925, -110.454353),
    entry("NE", "Nebraska", 41.125370, -98.268082),
    entry("NV", "Nevada", 38.313515, -117.055374),
    entry("NH", "New Hampshire", 43.452492, -71.563896),
    entry("NJ", "New Jersey", 40.298904, -74.521011),
    entry("NM", "New Mexico", 34.840515, -106.248482),
    entry("NY", "New York", 42.165726, -74.948051),
    entry("NC", "North Carolina", 35.630066, -79.806419),
    entry("ND", "North Dakota", 47.528912, -99.784012),
    entry("OH", "Ohio", 40.388783, -82.764915),
    entry("OK", "Oklahoma", 35.565342, -96.928917),
    entry("OR", "Oregon", 44.572021, -122.070938),
    entry("PA", "Pennsylvania", 40.590752, -77.209755),
    entry("PR", "Puerto Rico", 18.220833, -66.590149),
    entry("RI", "Rhode Island", 41.680893, -71.511780),
    entry("SC", "South Carolina", 33.856892, -80.945007),
    entry("SD", "South Dakota", 44.299782, -99.438828),
    entry("TN", "Tennessee", 35.747845, -86.692345),
    entry("TX", "Texas", 31.054487, -97.563461),
    entry("UT", "Utah", 40.150032, -111.862434),
    entry("VT", "Vermont", 44.045876, -72.710686),
    entry("VA", "Virginia", 37.769337, -78.169968),
    entry("WA", "Washington", 47.400902, -121.490494),
    entry("WV", "West Virginia", 38.491226, -80.954456),
    entry("WI", "Wisconsin", 44.268543, -89.616508),
    entry("WY", "Wyoming", 42.755966, -107.302490),
];

static US_LOOKUP: LazyLock<StateLookup> = LazyLock::new(|| StateLookup::new(US_STATES.to_vec()));

/// Bidirectional state lookup: abbreviation or full name, case-insensitive.
#[derive(Debug, Clone)]
pub struct StateLookup {
    entries: Vec<StateEntry>,
    by_key: HashMap<String, usize>,
}

impl StateLookup {
    /// Build a lookup over an arbitrary table.
    pub fn new(entries: Vec<StateEntry>) -> Self {
        let mut by_key = HashMap::with_capacity(entries.len() * 2);
        for (idx, entry) in entries.iter().enumerate() {
            by_key.insert(entry.abbreviation.to_lowercase(), idx);
            by_key.insert(entry.name.to_lowercase(), idx);
        }
        Self { entries, by_key }
    }

    /// The shared US table (50 states, DC and Puerto Rico).
    pub fn us() -> &'static StateLookup {
        &US_LOOKUP
    }

    fn find(&self, raw: &str) -> Option<&StateEntry> {
        let key = normalize_key(raw);
        self.by_key.get(&key).map(|&idx| &self.entries[idx])
    }

    /// Resolve a raw state value. Unknown values pass through unchanged,
    /// with the raw text used as both abbreviation and name.
    pub fn resolve(&self, raw: &str) -> StateRef {
        let trimmed = raw.trim();
        match self.find(trimmed) {
            Some(entry) => StateRef {
                abbreviation: entry.abbreviation.to_string(),
                name: entry.name.to_string(),
                known: true,
            },
            None => StateRef {
                abbreviation: trimmed.to_string(),
                name: trimmed.to_string(),
                known: false,
            },
        }
    }

    /// Centroid for a resolved abbreviation.
    pub fn centroid(&self, abbreviation: &str) -> Option<Coordinates> {
        self.find(abbreviation).map(|e| e.centroid)
    }
}

/// Lowercase, strip periods and collapse whitespace ("D.C." -> "dc").
fn normalize_key(raw: &str) -> String {
    raw.replace('.', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
