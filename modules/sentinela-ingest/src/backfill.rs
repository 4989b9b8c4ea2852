// Geocode backfill: fills coordinates for stored records that have none,
// or whose location text still carries an un-promoted "(lat,lon)" pair.
//
// Runs on its own timer and yields the whole pass while the same source's
// update cycle is in flight. Nothing in a pass is fatal: a record that
// cannot be resolved keeps null coordinates and is retried next pass.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sentinela_common::geo::{clean_location_text, split_embedded_coordinates};
use sentinela_common::{Coordinates, FeedSource, StoredRecord};

use crate::scheduler::UpdateScheduler;
use crate::traits::{Geocoder, RecordStore};

/// Suffix that pins free-text queries to the country.
const COUNTRY: &str = "Peru";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillCounters {
    pub passes: u64,
    pub skipped_busy: u64,
    /// Embedded pairs moved into the coordinate columns.
    pub promoted: u64,
    pub geocoded: u64,
    pub failed: u64,
}

impl BackfillCounters {
    fn absorb(&mut self, other: &BackfillCounters) {
        self.passes += other.passes;
        self.skipped_busy += other.skipped_busy;
        self.promoted += other.promoted;
        self.geocoded += other.geocoded;
        self.failed += other.failed;
    }
}

pub struct GeocodeBackfill {
    source: FeedSource,
    store: Arc<dyn RecordStore>,
    geocoder: Arc<dyn Geocoder>,
    scheduler: Option<UpdateScheduler>,
    batch: i64,
    interval: Duration,
    counters: Mutex<BackfillCounters>,
}

impl GeocodeBackfill {
    pub fn new(
        source: FeedSource,
        store: Arc<dyn RecordStore>,
        geocoder: Arc<dyn Geocoder>,
        batch: i64,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            store,
            geocoder,
            scheduler: None,
            batch,
            interval,
            counters: Mutex::new(BackfillCounters::default()),
        }
    }

    /// Yield to this scheduler's cycles.
    pub fn with_scheduler(mut self, scheduler: UpdateScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn source(&self) -> FeedSource {
        self.source
    }

    /// Cumulative counters across all passes.
    pub fn counters(&self) -> BackfillCounters {
        *self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One pass over up to `batch` records. Returns this pass's counts.
    pub async fn run_pass(&self) -> Result<BackfillCounters> {
        let mut pass = BackfillCounters::default();

        if self.scheduler.as_ref().is_some_and(UpdateScheduler::is_updating) {
            debug!(source = %self.source, "Backfill skipped, update cycle in flight");
            pass.skipped_busy = 1;
            self.record(&pass);
            return Ok(pass);
        }

        pass.passes = 1;
        let pending = match self.store.missing_geo(self.source, self.batch).await {
            Ok(pending) => pending,
            Err(e) => {
                self.record(&pass);
                return Err(e);
            }
        };

        for record in &pending {
            self.resolve(record, &mut pass).await;
        }

        self.record(&pass);
        if !pending.is_empty() {
            info!(
                source = %self.source,
                pending = pending.len(),
                promoted = pass.promoted,
                geocoded = pass.geocoded,
                failed = pass.failed,
                "Geocode backfill pass complete"
            );
        }
        Ok(pass)
    }

    /// Run a pass every interval, starting one interval from now.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let backfill = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + backfill.interval;
            let mut ticker = tokio::time::interval_at(start, backfill.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = backfill.run_pass().await {
                    warn!(source = %backfill.source, error = %e, "Geocode backfill pass failed");
                }
            }
        })
    }

    fn record(&self, pass: &BackfillCounters) {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .absorb(pass);
    }

    async fn resolve(&self, record: &StoredRecord, pass: &mut BackfillCounters) {
        let split = split_embedded_coordinates(&record.record.location_text);
        let had_pair = split.coordinates.is_some();
        // Rewrite the text only when a pair has to be stripped from it.
        let cleaned = had_pair.then_some(split.text.as_str());

        if let Some(coordinates) = split.coordinates.filter(Coordinates::is_valid) {
            if self.write(record, coordinates, cleaned, pass).await {
                pass.promoted += 1;
            }
            return;
        }

        for query in candidate_queries(record) {
            match self.geocoder.geocode(&query).await {
                Ok(Some(coordinates)) => {
                    if self.write(record, coordinates, cleaned, pass).await {
                        pass.geocoded += 1;
                    }
                    return;
                }
                Ok(None) => debug!(source = %self.source, query = %query, "No geocoder match"),
                Err(e) => warn!(source = %self.source, query = %query, error = %e, "Geocoder request failed"),
            }
        }

        warn!(
            source = %self.source,
            key = %record.record.natural_key,
            "Could not geocode record, leaving for next pass"
        );
        pass.failed += 1;
    }

    async fn write(
        &self,
        record: &StoredRecord,
        coordinates: Coordinates,
        location: Option<&str>,
        pass: &mut BackfillCounters,
    ) -> bool {
        match self
            .store
            .set_coordinates(self.source, record.id, coordinates, location)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!(source = %self.source, id = %record.id, error = %e, "Failed to store coordinates");
                pass.failed += 1;
                false
            }
        }
    }
}

/// Progressively coarser queries: full address, district and region,
/// region alone. Empty and repeated queries are dropped.
pub fn candidate_queries(record: &StoredRecord) -> Vec<String> {
    let r = &record.record;
    let address = clean_location_text(&r.location_text).replace(" - ", ", ");
    let district = r.district.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let region = r.region.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let district_region = [district, region].into_iter().flatten().collect::<Vec<_>>().join(", ");

    let mut queries: Vec<String> = Vec::new();
    for base in [address.as_str(), district_region.as_str(), region.unwrap_or("")] {
        if base.is_empty() {
            continue;
        }
        let query = format!("{base}, {COUNTRY}");
        if !queries.contains(&query) {
            queries.push(query);
        }
    }
    queries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, MockGeocoder, ScriptedClient};
    use chrono::{TimeZone, Utc};
    use sentinela_common::{FeedRecord, NewRecord, RecordDetails};
    use tokio::sync::Semaphore;

    fn emergency(location: &str, district: Option<&str>, region: Option<&str>) -> NewRecord {
        NewRecord {
            record: FeedRecord {
                natural_key: format!("em-{location}"),
                category: "INUNDACION".into(),
                location_text: location.into(),
                district: district.map(Into::into),
                province: None,
                region: region.map(Into::into),
                occurred_at: Utc.with_ymd_and_hms(2026, 10, 17, 15, 0, 0).unwrap(),
                latitude: None,
                longitude: None,
                raw_payload: serde_json::json!({}),
            },
            details: RecordDetails::Emergency {
                status: None,
                affected: 0,
                displaced: 0,
                deceased: 0,
            },
        }
    }

    fn seeded(store: &MemoryStore, record: NewRecord) -> uuid::Uuid {
        store.seed(record, Utc::now())
    }

    fn backfill(store: Arc<MemoryStore>, geocoder: Arc<MockGeocoder>) -> GeocodeBackfill {
        GeocodeBackfill::new(
            FeedSource::Emergencies,
            store,
            geocoder,
            25,
            Duration::from_secs(600),
        )
    }

    #[test]
    fn candidates_go_from_address_to_region() {
        let store = MemoryStore::new();
        seeded(&store, emergency("AV. GRAU 120 - PIURA", Some("Piura"), Some("Piura")));
        let record = &store.records(FeedSource::Emergencies)[0];

        assert_eq!(
            candidate_queries(record),
            vec!["AV. GRAU 120, PIURA, Peru", "Piura, Piura, Peru", "Piura, Peru"]
        );
    }

    #[test]
    fn candidates_skip_blanks_and_duplicates() {
        let store = MemoryStore::new();
        seeded(&store, emergency("Cusco", None, Some("Cusco")));
        let record = &store.records(FeedSource::Emergencies)[0];
        assert_eq!(candidate_queries(record), vec!["Cusco, Peru"]);
    }

    #[tokio::test]
    async fn embedded_pair_is_promoted_without_network() {
        let store = Arc::new(MemoryStore::new());
        let id = seeded(&store, emergency("KM 12 (-12.08,-77.05) - ANCON", Some("ANCON"), None));
        let geocoder = Arc::new(MockGeocoder::new());
        let backfill = backfill(store.clone(), geocoder.clone());

        let pass = backfill.run_pass().await.unwrap();
        assert_eq!(pass.promoted, 1);
        assert!(geocoder.calls().is_empty());

        let row = store.get(FeedSource::Emergencies, id).unwrap();
        assert_eq!((row.record.latitude, row.record.longitude), (Some(-12.08), Some(-77.05)));
        assert_eq!(row.record.location_text, "KM 12 - ANCON");

        assert_eq!(backfill.run_pass().await.unwrap().promoted, 0);
    }

    #[tokio::test]
    async fn falls_back_to_coarser_queries() {
        let store = Arc::new(MemoryStore::new());
        let id = seeded(&store, emergency("SECTOR 5 - CALLERIA", Some("Calleria"), Some("Ucayali")));
        let geocoder = Arc::new(
            MockGeocoder::new()
                .failing_on("SECTOR 5, CALLERIA, Peru")
                .on("Calleria, Ucayali, Peru", -8.38, -74.55),
        );
        let backfill = backfill(store.clone(), geocoder.clone());

        let pass = backfill.run_pass().await.unwrap();
        assert_eq!(pass.geocoded, 1);
        assert_eq!(pass.failed, 0);
        assert_eq!(
            geocoder.calls(),
            vec!["SECTOR 5, CALLERIA, Peru", "Calleria, Ucayali, Peru"]
        );

        let row = store.get(FeedSource::Emergencies, id).unwrap();
        assert_eq!(row.record.latitude, Some(-8.38));
        assert_eq!(row.record.location_text, "SECTOR 5 - CALLERIA");
    }

    #[tokio::test]
    async fn unresolved_records_are_counted_and_kept() {
        let store = Arc::new(MemoryStore::new());
        let id = seeded(&store, emergency("ZONA SIN NOMBRE", None, None));
        let backfill = backfill(store.clone(), Arc::new(MockGeocoder::new()));

        backfill.run_pass().await.unwrap();
        backfill.run_pass().await.unwrap();

        let counters = backfill.counters();
        assert_eq!(counters.passes, 2);
        assert_eq!(counters.failed, 2);
        assert_eq!(store.get(FeedSource::Emergencies, id).unwrap().record.latitude, None);
    }

    #[tokio::test]
    async fn yields_while_scheduler_is_updating() {
        let store = Arc::new(MemoryStore::new());
        seeded(&store, emergency("KM 3 (-12.1,-77.0)", None, None));

        let gate = Arc::new(Semaphore::new(0));
        let client = Arc::new(ScriptedClient::new(FeedSource::Emergencies).gated(gate.clone()));
        let scheduler = UpdateScheduler::new(client, store.clone(), Duration::from_secs(3600));
        let backfill = backfill(store.clone(), Arc::new(MockGeocoder::new())).with_scheduler(scheduler.clone());

        scheduler.force_update_now();
        let pass = backfill.run_pass().await.unwrap();
        assert_eq!(pass.skipped_busy, 1);
        assert_eq!(pass.promoted, 0);

        gate.add_permits(1);
        while scheduler.is_updating() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backfill.run_pass().await.unwrap().promoted, 1);

        let counters = backfill.counters();
        assert_eq!((counters.passes, counters.skipped_busy), (1, 1));
    }

    #[tokio::test]
    async fn store_outage_fails_the_pass() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let backfill = backfill(store, Arc::new(MockGeocoder::new()));
        assert!(backfill.run_pass().await.is_err());
        assert_eq!(backfill.counters().passes, 1);
    }
}
