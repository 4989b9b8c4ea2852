// Test doubles for the ingestion pipeline.
//
// MemoryStore (RecordStore) keeps rows in a HashMap and applies the same
// write rules as the Postgres store: first-seen occurred_at for emergencies
// (and for fires until a parsed timestamp replaces an estimated one), pair-only coordinate replacement, never-regress person
// counts and fill-only earthquake links. It can be switched to "unavailable"
// to simulate a datastore outage.
//
// MockGeocoder (Geocoder) answers from a query→coordinates table and
// records every query it receives.
//
// ScriptedClient (SourceClient) replays queued fetch results. An optional
// semaphore gate holds each fetch until a permit is added, so tests can
// observe a cycle while it is in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use sentinela_common::geo::has_embedded_coordinates;
use sentinela_common::{
    Coordinates, EarthquakeLinks, FeedSource, NewRecord, QueryWindow, RecordDetails, StoredRecord,
    UpsertReport, EMERGENCY_IDENTITY_FIELDS,
};
use sentinela_sources::{FetchError, FireRow, RawRecord, SourceClient};

use crate::traits::{Geocoder, RecordStore};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<FeedSource, Vec<StoredRecord>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the datastore were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a row directly, bypassing the upsert rules. Returns its id.
    pub fn seed(&self, record: NewRecord, created_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let stored = StoredRecord {
            id,
            source: record.source(),
            record: record.record,
            details: record.details,
            created_at,
            updated_at: created_at,
        };
        self.rows
            .lock()
            .unwrap()
            .entry(stored.source)
            .or_default()
            .push(stored);
        id
    }

    pub fn records(&self, source: FeedSource) -> Vec<StoredRecord> {
        self.rows.lock().unwrap().get(&source).cloned().unwrap_or_default()
    }

    pub fn count(&self, source: FeedSource) -> usize {
        self.rows.lock().unwrap().get(&source).map_or(0, Vec::len)
    }

    pub fn get(&self, source: FeedSource, id: Uuid) -> Option<StoredRecord> {
        self.records(source).into_iter().find(|r| r.id == id)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("datastore unavailable: connection refused");
        }
        Ok(())
    }

    fn apply(existing: &mut StoredRecord, incoming: &NewRecord) {
        let old = existing.record.clone();
        let new = &incoming.record;

        existing.record.category = new.category.clone();
        existing.record.location_text = new.location_text.clone();
        existing.record.district = new.district.clone().or(old.district);
        existing.record.province = new.province.clone().or(old.province);
        existing.record.region = new.region.clone().or(old.region);
        existing.record.raw_payload = new.raw_payload.clone();
        if let (Some(lat), Some(lon)) = (new.latitude, new.longitude) {
            existing.record.latitude = Some(lat);
            existing.record.longitude = Some(lon);
        }

        existing.details = match (&existing.details, &incoming.details) {
            (
                RecordDetails::Earthquake {
                    magnitude,
                    magnitude_type,
                    depth_km,
                    intensity,
                    reference,
                    links,
                    ..
                },
                RecordDetails::Earthquake {
                    utc_date,
                    utc_time,
                    magnitude: new_magnitude,
                    magnitude_type: new_magnitude_type,
                    depth_km: new_depth,
                    intensity: new_intensity,
                    reference: new_reference,
                    links: new_links,
                },
            ) => {
                existing.record.occurred_at = new.occurred_at;
                RecordDetails::Earthquake {
                    utc_date: *utc_date,
                    utc_time: *utc_time,
                    magnitude: new_magnitude.or(*magnitude),
                    magnitude_type: new_magnitude_type.clone().or_else(|| magnitude_type.clone()),
                    depth_km: new_depth.or(*depth_km),
                    intensity: new_intensity.clone().or_else(|| intensity.clone()),
                    reference: new_reference.clone().or_else(|| reference.clone()),
                    links: fill_links(links, new_links),
                }
            }
            (
                RecordDetails::Emergency {
                    status,
                    affected,
                    displaced,
                    deceased,
                },
                RecordDetails::Emergency {
                    status: new_status,
                    affected: new_affected,
                    displaced: new_displaced,
                    deceased: new_deceased,
                },
            ) => RecordDetails::Emergency {
                status: new_status.clone().or_else(|| status.clone()),
                affected: never_regress(*affected, *new_affected),
                displaced: never_regress(*displaced, *new_displaced),
                deceased: never_regress(*deceased, *new_deceased),
            },
            (
                RecordDetails::Fire { time_estimated, .. },
                RecordDetails::Fire {
                    status,
                    vehicles,
                    time_estimated: new_estimated,
                },
            ) => {
                if !new_estimated {
                    existing.record.occurred_at = new.occurred_at;
                }
                RecordDetails::Fire {
                    status: status.clone(),
                    vehicles: vehicles.clone(),
                    time_estimated: *time_estimated && *new_estimated,
                }
            }
            (_, details) => details.clone(),
        };
        existing.updated_at = Utc::now();
    }
}

fn never_regress(stored: i32, incoming: i32) -> i32 {
    if incoming == 0 {
        stored
    } else {
        incoming
    }
}

fn fill_links(stored: &EarthquakeLinks, incoming: &EarthquakeLinks) -> EarthquakeLinks {
    let pick = |new: &Option<String>, old: &Option<String>| new.clone().or_else(|| old.clone());
    EarthquakeLinks {
        report_pdf: pick(&incoming.report_pdf, &stored.report_pdf),
        accelerometric_map: pick(&incoming.accelerometric_map, &stored.accelerometric_map),
        intensity_map: pick(&incoming.intensity_map, &stored.intensity_map),
        thematic_map: pick(&incoming.thematic_map, &stored.thematic_map),
        shake_map: pick(&incoming.shake_map, &stored.shake_map),
        technical_report: pick(&incoming.technical_report, &stored.technical_report),
    }
}

fn needs_geo(record: &StoredRecord) -> bool {
    !record.record.has_valid_coordinates() || has_embedded_coordinates(&record.record.location_text)
}

fn payload_identity(payload: &Value) -> Option<String> {
    EMERGENCY_IDENTITY_FIELDS.iter().find_map(|field| match payload.get(*field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn newest_first(rows: &mut [StoredRecord]) {
    rows.sort_by(|a, b| {
        b.record
            .occurred_at
            .cmp(&a.record.occurred_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, source: FeedSource, records: &[NewRecord]) -> Result<UpsertReport> {
        self.check_available()?;
        let mut report = UpsertReport::default();
        let mut rows = self.rows.lock().unwrap();
        let table = rows.entry(source).or_default();

        for record in records {
            if record.source() != source {
                report.failed += 1;
                continue;
            }
            match table
                .iter_mut()
                .find(|r| r.record.natural_key == record.record.natural_key)
            {
                Some(existing) => {
                    Self::apply(existing, record);
                    report.updated += 1;
                }
                None => {
                    let now = Utc::now();
                    table.push(StoredRecord {
                        id: Uuid::new_v4(),
                        source,
                        record: record.record.clone(),
                        details: record.details.clone(),
                        created_at: now,
                        updated_at: now,
                    });
                    report.inserted += 1;
                }
            }
        }
        Ok(report)
    }

    async fn range_query(
        &self,
        source: FeedSource,
        now: DateTime<Utc>,
        window: QueryWindow,
    ) -> Result<Vec<StoredRecord>> {
        self.check_available()?;
        let (from, to) = window.bounds(now);
        let mut rows: Vec<StoredRecord> = self
            .records(source)
            .into_iter()
            .filter(|r| r.record.occurred_at >= from && r.record.occurred_at <= to)
            .collect();
        newest_first(&mut rows);
        Ok(rows)
    }

    async fn by_district(&self, source: FeedSource, district: &str) -> Result<Vec<StoredRecord>> {
        self.check_available()?;
        let wanted = district.trim().to_lowercase();
        let mut rows: Vec<StoredRecord> = self
            .records(source)
            .into_iter()
            .filter(|r| r.record.district.as_deref().map(str::to_lowercase) == Some(wanted.clone()))
            .collect();
        newest_first(&mut rows);
        Ok(rows)
    }

    async fn by_natural_key(&self, source: FeedSource, key: &str) -> Result<Option<StoredRecord>> {
        self.check_available()?;
        Ok(self
            .records(source)
            .into_iter()
            .find(|r| r.record.natural_key == key))
    }

    async fn missing_geo(&self, source: FeedSource, limit: i64) -> Result<Vec<StoredRecord>> {
        self.check_available()?;
        let mut rows: Vec<StoredRecord> = self.records(source).into_iter().filter(needs_geo).collect();
        newest_first(&mut rows);
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn set_coordinates(
        &self,
        source: FeedSource,
        id: Uuid,
        coordinates: Coordinates,
        location: Option<&str>,
    ) -> Result<bool> {
        self.check_available()?;
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows
            .get_mut(&source)
            .and_then(|table| table.iter_mut().find(|r| r.id == id))
        else {
            return Ok(false);
        };
        if !needs_geo(row) {
            return Ok(false);
        }
        row.record.latitude = Some(coordinates.latitude);
        row.record.longitude = Some(coordinates.longitude);
        if let Some(location) = location {
            row.record.location_text = location.to_string();
        }
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn recover_identity_duplicates(&self) -> Result<u64> {
        self.check_available()?;
        let mut rows = self.rows.lock().unwrap();
        let Some(table) = rows.get_mut(&FeedSource::Emergencies) else {
            return Ok(0);
        };

        table.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut seen = HashSet::new();
        let before = table.len();
        table.retain(|r| match payload_identity(&r.record.raw_payload) {
            Some(identity) => seen.insert(identity),
            None => true,
        });
        Ok((before - table.len()) as u64)
    }

    async fn earthquakes_missing_links(&self, limit: i64) -> Result<Vec<String>> {
        self.check_available()?;
        let mut rows: Vec<StoredRecord> = self
            .records(FeedSource::Earthquakes)
            .into_iter()
            .filter(|r| matches!(&r.details, RecordDetails::Earthquake { links, .. } if !links.is_complete()))
            .collect();
        newest_first(&mut rows);
        Ok(rows
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|r| r.record.natural_key)
            .collect())
    }

    async fn update_earthquake_links(&self, code: &str, links: &EarthquakeLinks) -> Result<bool> {
        self.check_available()?;
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows
            .get_mut(&FeedSource::Earthquakes)
            .and_then(|table| table.iter_mut().find(|r| r.record.natural_key == code))
        else {
            return Ok(false);
        };
        if let RecordDetails::Earthquake { links: stored, .. } = &mut row.details {
            *stored = fill_links(stored, links);
            row.updated_at = Utc::now();
            return Ok(true);
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// MockGeocoder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockGeocoder {
    answers: HashMap<String, Coordinates>,
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl MockGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, query: &str, latitude: f64, longitude: f64) -> Self {
        self.answers
            .insert(query.to_string(), Coordinates::new(latitude, longitude));
        self
    }

    /// Fail `query` with an error instead of answering "no match".
    pub fn failing_on(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>> {
        self.calls.lock().unwrap().push(query.to_string());
        if self.failing.contains(query) {
            bail!("geocoder returned HTTP 503 for {query}");
        }
        Ok(self.answers.get(query).copied())
    }
}

// ---------------------------------------------------------------------------
// ScriptedClient
// ---------------------------------------------------------------------------

pub struct ScriptedClient {
    source: FeedSource,
    script: Mutex<VecDeque<Result<Vec<RawRecord>, FetchError>>>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(source: FeedSource) -> Self {
        Self {
            source,
            script: Mutex::new(VecDeque::new()),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue the result of the next fetch. An exhausted script yields an
    /// empty batch.
    pub fn then(self, result: Result<Vec<RawRecord>, FetchError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    /// Hold every fetch until a permit is available on `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn fetch_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for ScriptedClient {
    fn source(&self) -> FeedSource {
        self.source
    }

    async fn fetch(&self) -> sentinela_sources::Result<Vec<RawRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
    }
}

/// A scraped fire row with no status or vehicles.
pub fn fire_row(number: &str, reported_at: &str, location: &str) -> FireRow {
    FireRow {
        number: number.to_string(),
        reported_at: reported_at.to_string(),
        location: location.to_string(),
        category: "INCENDIO URBANO".to_string(),
        status: None,
        vehicles: None,
    }
}
