// Earthquake link enrichment.
//
// The year listing often publishes an event before its report PDF and maps
// exist. After each earthquake cycle, recent events with empty link columns
// are re-fetched by code and whatever links are now published are filled in.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use sentinela_sources::SeismicClient;

use crate::traits::{CycleHook, RecordStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentCounters {
    pub checked: u64,
    pub updated: u64,
    pub failed: u64,
}

pub struct EarthquakeEnricher {
    client: Arc<SeismicClient>,
    store: Arc<dyn RecordStore>,
    batch: i64,
    counters: Mutex<EnrichmentCounters>,
}

impl EarthquakeEnricher {
    pub fn new(client: Arc<SeismicClient>, store: Arc<dyn RecordStore>, batch: i64) -> Self {
        Self {
            client,
            store,
            batch,
            counters: Mutex::new(EnrichmentCounters::default()),
        }
    }

    pub fn counters(&self) -> EnrichmentCounters {
        *self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One enrichment round. Returns this round's counts.
    pub async fn enrich(&self) -> EnrichmentCounters {
        let mut round = EnrichmentCounters::default();

        let codes = match self.store.earthquakes_missing_links(self.batch).await {
            Ok(codes) => codes,
            Err(e) => {
                warn!(error = %e, "Could not list earthquakes missing links");
                round.failed += 1;
                self.record(&round);
                return round;
            }
        };

        for code in &codes {
            round.checked += 1;
            let detail = match self.client.fetch_detail(code).await {
                Ok(Some(detail)) => detail,
                Ok(None) => continue,
                Err(e) => {
                    warn!(code = %code, error = %e, "Earthquake detail fetch failed");
                    round.failed += 1;
                    continue;
                }
            };

            let links = detail.links();
            if links.missing() == 6 {
                continue;
            }
            match self.store.update_earthquake_links(code, &links).await {
                Ok(true) => round.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(code = %code, error = %e, "Failed to store earthquake links");
                    round.failed += 1;
                }
            }
        }

        if !codes.is_empty() {
            info!(
                checked = round.checked,
                updated = round.updated,
                failed = round.failed,
                "Earthquake link enrichment complete"
            );
        }
        self.record(&round);
        round
    }

    fn record(&self, round: &EnrichmentCounters) {
        let mut counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.checked += round.checked;
        counters.updated += round.updated;
        counters.failed += round.failed;
    }
}

#[async_trait]
impl CycleHook for EarthquakeEnricher {
    async fn after_store(&self) {
        self.enrich().await;
    }
}
