use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SentinelaError;

// --- Sources ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    /// Scraped fire-department incident table.
    FireIncidents,
    /// Seismological REST API.
    Earthquakes,
    /// Civil-defense GeoJSON feed.
    Emergencies,
}

impl FeedSource {
    pub const ALL: [FeedSource; 3] = [
        FeedSource::FireIncidents,
        FeedSource::Earthquakes,
        FeedSource::Emergencies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedSource::FireIncidents => "fire_incidents",
            FeedSource::Earthquakes => "earthquakes",
            FeedSource::Emergencies => "emergencies",
        }
    }
}

impl std::fmt::Display for FeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeedSource {
    type Err = SentinelaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fire_incidents" | "fires" | "fire" => Ok(FeedSource::FireIncidents),
            "earthquakes" | "earthquake" | "quakes" => Ok(FeedSource::Earthquakes),
            "emergencies" | "emergency" | "civil_defense" => Ok(FeedSource::Emergencies),
            other => Err(SentinelaError::UnknownSource(other.to_string())),
        }
    }
}

// --- Canonical record ---

/// Canonical normalized shape shared by every source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub natural_key: String,
    pub category: String,
    pub location_text: String,
    pub district: Option<String>,
    pub province: Option<String>,
    pub region: Option<String>,
    /// Always populated; falls back to ingestion time when the source is malformed.
    pub occurred_at: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub raw_payload: serde_json::Value,
}

impl FeedRecord {
    pub fn has_valid_coordinates(&self) -> bool {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => crate::geo::is_valid_coord(lat, lon),
            _ => false,
        }
    }
}

/// The six enrichment URLs published for an earthquake. Any of them may be
/// missing on the first sighting and filled in by later detail fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarthquakeLinks {
    pub report_pdf: Option<String>,
    pub accelerometric_map: Option<String>,
    pub intensity_map: Option<String>,
    pub thematic_map: Option<String>,
    pub shake_map: Option<String>,
    pub technical_report: Option<String>,
}

impl EarthquakeLinks {
    fn slots(&self) -> [&Option<String>; 6] {
        [
            &self.report_pdf,
            &self.accelerometric_map,
            &self.intensity_map,
            &self.thematic_map,
            &self.shake_map,
            &self.technical_report,
        ]
    }

    /// Number of link columns still empty.
    pub fn missing(&self) -> usize {
        self.slots()
            .iter()
            .filter(|s| s.as_deref().map_or(true, |v| v.trim().is_empty()))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }
}

/// Raw-payload attribute keys that carry the civil-defense provider's true
/// identity for an emergency, in preference order.
pub const EMERGENCY_IDENTITY_FIELDS: [&str; 3] = ["CODIGO", "CODIGO_SINPAD", "COD_SINPAD"];

/// Source-specific columns carried next to the canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordDetails {
    Fire {
        status: Option<String>,
        vehicles: Option<String>,
        /// The published timestamp was unparsable and ingestion time stands
        /// in for it.
        #[serde(default)]
        time_estimated: bool,
    },
    Earthquake {
        /// Date-bearing value as published (only its calendar day matters).
        utc_date: DateTime<Utc>,
        /// Time-bearing value whose own date is an epoch placeholder.
        utc_time: Option<DateTime<Utc>>,
        magnitude: Option<f64>,
        magnitude_type: Option<String>,
        depth_km: Option<f64>,
        intensity: Option<String>,
        reference: Option<String>,
        links: EarthquakeLinks,
    },
    Emergency {
        status: Option<String>,
        affected: i32,
        displaced: i32,
        deceased: i32,
    },
}

impl RecordDetails {
    pub fn source(&self) -> FeedSource {
        match self {
            RecordDetails::Fire { .. } => FeedSource::FireIncidents,
            RecordDetails::Earthquake { .. } => FeedSource::Earthquakes,
            RecordDetails::Emergency { .. } => FeedSource::Emergencies,
        }
    }
}

/// A normalized record ready to be upserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub record: FeedRecord,
    pub details: RecordDetails,
}

impl NewRecord {
    pub fn source(&self) -> FeedSource {
        self.details.source()
    }
}

/// A persisted record as returned by queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub source: FeedSource,
    #[serde(flatten)]
    pub record: FeedRecord,
    pub details: RecordDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one batch upsert. Failed records do not abort the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl UpsertReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

// --- Queries ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryWindow {
    Hours(u32),
    Days(u32),
}

impl QueryWindow {
    pub fn duration(&self) -> Duration {
        match *self {
            QueryWindow::Hours(h) => Duration::hours(i64::from(h)),
            QueryWindow::Days(d) => Duration::days(i64::from(d)),
        }
    }

    /// Inclusive `[now - window, now]` bounds. The lower bound never goes
    /// below the Unix epoch, so oversized windows mean "everything".
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let from = now
            .checked_sub_signed(self.duration())
            .map_or(DateTime::UNIX_EPOCH, |from| from.max(DateTime::UNIX_EPOCH));
        (from, now)
    }
}

impl Default for QueryWindow {
    fn default() -> Self {
        QueryWindow::Hours(24)
    }
}
