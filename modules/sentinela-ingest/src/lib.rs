pub mod backfill;
pub mod enrichment;
pub mod error;
pub mod feeds;
pub mod geocoder;
pub mod scheduler;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backfill::{BackfillCounters, GeocodeBackfill};
pub use enrichment::{EarthquakeEnricher, EnrichmentCounters};
pub use error::CycleError;
pub use feeds::Feeds;
pub use geocoder::NominatimGeocoder;
pub use scheduler::{CycleReport, Phase, SchedulerStatus, UpdateScheduler, UpdateTrigger};
pub use traits::{CycleHook, Geocoder, RecordStore};
