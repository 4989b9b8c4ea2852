use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        is_valid_coord(self.latitude, self.longitude)
    }
}

/// A pair is usable iff both parts are finite, in range, and not the (0,0)
/// placeholder some feeds emit for "unknown".
pub fn is_valid_coord(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
        && !(lat == 0.0 && lon == 0.0)
}

/// Returns the pair only when it is valid.
pub fn valid_pair(lat: Option<f64>, lon: Option<f64>) -> Option<Coordinates> {
    match (lat, lon) {
        (Some(lat), Some(lon)) if is_valid_coord(lat, lon) => Some(Coordinates::new(lat, lon)),
        _ => None,
    }
}

static EMBEDDED_COORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*(-?\d{1,3}(?:\.\d+)?)\s*,\s*(-?\d{1,3}(?:\.\d+)?)\s*\)")
        .expect("Invalid embedded coordinate regex")
});

static MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("Invalid whitespace regex"));

/// Location text with any embedded coordinate pair split out.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitLocation {
    pub text: String,
    /// The parsed pair, whether or not it is valid.
    pub coordinates: Option<Coordinates>,
}

/// Pull a `(lat,lon)` pair out of free location text and return the text
/// without it. Text with no pair is only whitespace-normalized.
pub fn split_embedded_coordinates(text: &str) -> SplitLocation {
    let coordinates = EMBEDDED_COORD.captures(text).and_then(|cap| {
        let lat = cap.get(1)?.as_str().parse::<f64>().ok()?;
        let lon = cap.get(2)?.as_str().parse::<f64>().ok()?;
        Some(Coordinates::new(lat, lon))
    });

    SplitLocation {
        text: clean_location_text(text),
        coordinates,
    }
}

pub fn has_embedded_coordinates(text: &str) -> bool {
    EMBEDDED_COORD.is_match(text)
}

/// Strip coordinate pairs and collapse whitespace and dangling separators.
pub fn clean_location_text(text: &str) -> String {
    let stripped = EMBEDDED_COORD.replace_all(text, " ");
    let collapsed = MULTI_SPACE.replace_all(stripped.trim(), " ");
    collapsed
        .trim_matches(|c: char| c.is_whitespace() || c == ',' || c == '-')
        .to_string()
}

/// District taken from the final hyphen-delimited token of the location,
/// e.g. `"AV. LOS OLIVOS 123 - SAN MARTIN DE PORRES"`.
pub fn derive_district(location_text: &str) -> Option<String> {
    let cleaned = clean_location_text(location_text);
    if !cleaned.contains('-') {
        return None;
    }
    cleaned
        .rsplit('-')
        .next()
        .map(str::trim)
        .filter(|d| !d.is_empty() && !d.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}
