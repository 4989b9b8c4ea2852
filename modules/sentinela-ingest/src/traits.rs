// Trait seams for the ingestion pipeline.
//
// RecordStore: everything the scheduler, backfill, enrichment and facade
//   need from persistence. Implemented by the Postgres Store.
// Geocoder: free-text query to coordinates.
// CycleHook: work run after a successful store stage.
//
// Tests swap in MemoryStore / MockGeocoder (see testing.rs): no network,
// no database, no Docker.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use sentinela_common::{
    Coordinates, EarthquakeLinks, FeedSource, NewRecord, QueryWindow, StoredRecord, UpsertReport,
};
use sentinela_store::Store;

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, source: FeedSource, records: &[NewRecord]) -> Result<UpsertReport>;

    async fn range_query(
        &self,
        source: FeedSource,
        now: DateTime<Utc>,
        window: QueryWindow,
    ) -> Result<Vec<StoredRecord>>;

    async fn by_district(&self, source: FeedSource, district: &str) -> Result<Vec<StoredRecord>>;

    async fn by_natural_key(&self, source: FeedSource, key: &str) -> Result<Option<StoredRecord>>;

    async fn missing_geo(&self, source: FeedSource, limit: i64) -> Result<Vec<StoredRecord>>;

    async fn set_coordinates(
        &self,
        source: FeedSource,
        id: Uuid,
        coordinates: Coordinates,
        location: Option<&str>,
    ) -> Result<bool>;

    async fn recover_identity_duplicates(&self) -> Result<u64>;

    async fn earthquakes_missing_links(&self, limit: i64) -> Result<Vec<String>>;

    async fn update_earthquake_links(&self, code: &str, links: &EarthquakeLinks) -> Result<bool>;
}

#[async_trait]
impl RecordStore for Store {
    async fn upsert(&self, source: FeedSource, records: &[NewRecord]) -> Result<UpsertReport> {
        Ok(Store::upsert(self, source, records).await?)
    }

    async fn range_query(
        &self,
        source: FeedSource,
        now: DateTime<Utc>,
        window: QueryWindow,
    ) -> Result<Vec<StoredRecord>> {
        Ok(Store::range_query(self, source, now, window).await?)
    }

    async fn by_district(&self, source: FeedSource, district: &str) -> Result<Vec<StoredRecord>> {
        Ok(Store::by_district(self, source, district).await?)
    }

    async fn by_natural_key(&self, source: FeedSource, key: &str) -> Result<Option<StoredRecord>> {
        Ok(Store::by_natural_key(self, source, key).await?)
    }

    async fn missing_geo(&self, source: FeedSource, limit: i64) -> Result<Vec<StoredRecord>> {
        Ok(Store::missing_geo(self, source, limit).await?)
    }

    async fn set_coordinates(
        &self,
        source: FeedSource,
        id: Uuid,
        coordinates: Coordinates,
        location: Option<&str>,
    ) -> Result<bool> {
        Ok(Store::set_coordinates(
            self,
            source,
            id,
            coordinates.latitude,
            coordinates.longitude,
            location,
        )
        .await?)
    }

    async fn recover_identity_duplicates(&self) -> Result<u64> {
        Ok(Store::recover_identity_duplicates(self).await?)
    }

    async fn earthquakes_missing_links(&self, limit: i64) -> Result<Vec<String>> {
        Ok(Store::earthquakes_missing_links(self, limit).await?)
    }

    async fn update_earthquake_links(&self, code: &str, links: &EarthquakeLinks) -> Result<bool> {
        Ok(Store::update_earthquake_links(self, code, links).await?)
    }
}

// ---------------------------------------------------------------------------
// Geocoder
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolve a free-text place query. `Ok(None)` means no match.
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>>;
}

// ---------------------------------------------------------------------------
// CycleHook
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CycleHook: Send + Sync {
    /// Runs after a cycle's records are stored. Must not fail the cycle.
    async fn after_store(&self);
}
