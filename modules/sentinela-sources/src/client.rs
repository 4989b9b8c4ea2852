use async_trait::async_trait;

use sentinela_common::FeedSource;

use crate::error::Result;
use crate::services::civil_defense::EmergencyFeature;
use crate::services::fire::FireRow;
use crate::services::seismic::SeismicEvent;

/// One record as fetched, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Fire(FireRow),
    Earthquake(SeismicEvent),
    Emergency(EmergencyFeature),
}

/// A client for one external feed.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> FeedSource;

    /// Fetch the feed's current records.
    async fn fetch(&self) -> Result<Vec<RawRecord>>;
}
