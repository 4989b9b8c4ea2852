// Feeds: the inbound surface of the ingestion core.
//
// Owns one UpdateScheduler per registered source, the geocode backfills,
// the proxy pool's refresh loop and the shared store. Everything a routing
// layer or the CLI needs goes through here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::info;

use sentinela_common::{Config, FeedSource, QueryWindow, StoredRecord};
use sentinela_sources::{
    CivilDefenseClient, FireClient, HttpFetcher, ProxyPool, ProxyPoolSettings, ProxyPoolStatus,
    ReqwestFetcher, SeismicClient,
};
use sentinela_store::Store;

use crate::backfill::{BackfillCounters, GeocodeBackfill};
use crate::enrichment::{EarthquakeEnricher, EnrichmentCounters};
use crate::geocoder::NominatimGeocoder;
use crate::scheduler::{CycleReport, SchedulerStatus, UpdateScheduler, UpdateTrigger};
use crate::traits::{Geocoder, RecordStore};

/// Browser-like agent for the feed portals; the scraped one rejects
/// obvious bots.
const FEED_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// Sources whose coordinates are backfilled. Earthquakes always carry an
/// epicentre from the API.
const BACKFILLED: [FeedSource; 2] = [FeedSource::FireIncidents, FeedSource::Emergencies];

pub struct Feeds {
    store: Arc<dyn RecordStore>,
    schedulers: HashMap<FeedSource, UpdateScheduler>,
    backfills: HashMap<FeedSource, Arc<GeocodeBackfill>>,
    enricher: Option<Arc<EarthquakeEnricher>>,
    proxies: Option<(ProxyPool, Duration)>,
    started: Mutex<HashSet<FeedSource>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dedup_deleted: AtomicU64,
}

impl Feeds {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            schedulers: HashMap::new(),
            backfills: HashMap::new(),
            enricher: None,
            proxies: None,
            started: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            dedup_deleted: AtomicU64::new(0),
        }
    }

    pub fn with_scheduler(mut self, scheduler: UpdateScheduler) -> Self {
        self.schedulers.insert(scheduler.source(), scheduler);
        self
    }

    pub fn with_backfill(mut self, backfill: GeocodeBackfill) -> Self {
        self.backfills.insert(backfill.source(), Arc::new(backfill));
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<EarthquakeEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Refresh `pool` at startup and every `interval` once started.
    pub fn with_proxies(mut self, pool: ProxyPool, interval: Duration) -> Self {
        self.proxies = Some((pool, interval));
        self
    }

    /// Wire the production stack: Postgres (migrated), the three feed
    /// clients, proxy rotation for the scraped feed, Nominatim backfills and
    /// earthquake link enrichment.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = Store::connect(&config.database_url, config.database_max_connections)
            .await
            .context("Failed to connect to database")?;
        store.migrate().await.context("Failed to run migrations")?;
        let store: Arc<dyn RecordStore> = Arc::new(store);

        let fetcher: Arc<dyn HttpFetcher> =
            Arc::new(ReqwestFetcher::new(config.http_timeout, FEED_USER_AGENT)?);

        let pool = ProxyPool::new(
            fetcher.clone(),
            ProxyPoolSettings {
                directory_url: config.proxy_directory_url.clone(),
                max_latency_ms: config.proxy_max_latency_ms,
                cap: config.proxy_pool_cap,
            },
        );

        let fire = FireClient::new(fetcher.clone(), &config.fire_feed_url)
            .with_proxies(pool.clone())
            .with_max_attempts(config.fire_max_attempts)
            .with_backoff(config.fire_backoff)
            .with_max_proxy_draws(config.proxy_max_draws as usize);
        let seismic = Arc::new(SeismicClient::new(
            fetcher.clone(),
            &config.seismic_year_url,
            &config.seismic_detail_url,
        ));
        let civil_defense = CivilDefenseClient::new(fetcher, &config.civil_defense_query_url);

        let enricher = Arc::new(EarthquakeEnricher::new(
            seismic.clone(),
            store.clone(),
            config.enrich_batch,
        ));

        let geocoder_fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new(
            config.http_timeout,
            config.geocoder_user_agent.clone(),
        )?);
        // One geocoder for every backfill, so spacing holds across sources.
        let geocoder: Arc<dyn Geocoder> = Arc::new(NominatimGeocoder::new(
            geocoder_fetcher,
            &config.geocoder_url,
            config.geocoder_spacing,
            config.geocoder_cache_ttl,
        ));

        let schedulers = [
            UpdateScheduler::new(
                Arc::new(fire),
                store.clone(),
                config.update_interval(FeedSource::FireIncidents),
            ),
            UpdateScheduler::new(
                seismic,
                store.clone(),
                config.update_interval(FeedSource::Earthquakes),
            )
            .with_hook(enricher.clone()),
            UpdateScheduler::new(
                Arc::new(civil_defense),
                store.clone(),
                config.update_interval(FeedSource::Emergencies),
            ),
        ];

        let mut feeds = Feeds::new(store.clone())
            .with_enricher(enricher)
            .with_proxies(pool, config.proxy_refresh_interval);
        for scheduler in schedulers {
            if BACKFILLED.contains(&scheduler.source()) {
                feeds = feeds.with_backfill(
                    GeocodeBackfill::new(
                        scheduler.source(),
                        store.clone(),
                        geocoder.clone(),
                        config.backfill_batch,
                        config.backfill_interval,
                    )
                    .with_scheduler(scheduler.clone()),
                );
            }
            feeds = feeds.with_scheduler(scheduler);
        }
        Ok(feeds)
    }

    fn scheduler(&self, source: FeedSource) -> Result<&UpdateScheduler> {
        self.schedulers
            .get(&source)
            .ok_or_else(|| anyhow!("No scheduler registered for {source}"))
    }

    /// Start the periodic cycle (and backfill, if any) for `source`.
    /// Starting an already started source is a no-op.
    pub fn start(&self, source: FeedSource) -> Result<()> {
        let scheduler = self.scheduler(source)?;
        if !self.lock_started().insert(source) {
            return Ok(());
        }

        let mut tasks = self.lock_tasks();
        tasks.push(scheduler.start());
        if let Some(backfill) = self.backfills.get(&source) {
            info!(source = %source, "Starting geocode backfill");
            tasks.push(backfill.start());
        }
        Ok(())
    }

    /// Start the proxy refresh loop and every registered source.
    pub fn start_all(&self) -> Result<()> {
        if let Some((pool, interval)) = &self.proxies {
            self.lock_tasks().push(pool.spawn_refresh_loop(*interval));
        }
        let mut sources: Vec<FeedSource> = self.schedulers.keys().copied().collect();
        sources.sort_by_key(|s| s.as_str());
        for source in sources {
            self.start(source)?;
        }
        Ok(())
    }

    /// Abort every background task started by this instance.
    pub fn shutdown(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.lock_started().clear();
    }

    /// Refresh the proxy pool once. `None` when no pool is configured.
    pub async fn refresh_proxies(&self) -> Result<Option<usize>> {
        match &self.proxies {
            Some((pool, _)) => Ok(Some(pool.refresh().await?)),
            None => Ok(None),
        }
    }

    pub fn force_update_now(&self, source: FeedSource) -> Result<UpdateTrigger> {
        Ok(self.scheduler(source)?.force_update_now())
    }

    /// Run one cycle on the caller's task and return its report.
    pub async fn update_now(&self, source: FeedSource) -> Result<CycleReport> {
        Ok(self.scheduler(source)?.update_now().await?)
    }

    pub fn status(&self, source: FeedSource) -> Result<SchedulerStatus> {
        Ok(self.scheduler(source)?.status())
    }

    /// Records whose instant falls within `window` of now, newest first.
    /// No match is an empty list.
    pub async fn query(&self, source: FeedSource, window: QueryWindow) -> Result<Vec<StoredRecord>> {
        self.store.range_query(source, Utc::now(), window).await
    }

    pub async fn query_by_district(&self, source: FeedSource, district: &str) -> Result<Vec<StoredRecord>> {
        self.store.by_district(source, district).await
    }

    pub async fn query_by_natural_key(&self, source: FeedSource, key: &str) -> Result<Option<StoredRecord>> {
        self.store.by_natural_key(source, key).await
    }

    /// Delete civil-defense rows that share a provider identity, keeping the
    /// earliest. Returns rows deleted by this run.
    pub async fn recover_identity_duplicates(&self) -> Result<u64> {
        let deleted = self.store.recover_identity_duplicates().await?;
        self.dedup_deleted.fetch_add(deleted, Ordering::SeqCst);
        info!(deleted, "Identity duplicate recovery complete");
        Ok(deleted)
    }

    /// Rows deleted by every dedup run so far.
    pub fn dedup_deleted_total(&self) -> u64 {
        self.dedup_deleted.load(Ordering::SeqCst)
    }

    pub fn backfill_counters(&self, source: FeedSource) -> Option<BackfillCounters> {
        self.backfills.get(&source).map(|b| b.counters())
    }

    pub fn enrichment_counters(&self) -> Option<EnrichmentCounters> {
        self.enricher.as_ref().map(|e| e.counters())
    }

    pub fn proxy_status(&self) -> Option<ProxyPoolStatus> {
        self.proxies.as_ref().map(|(pool, _)| pool.status())
    }

    fn lock_started(&self) -> std::sync::MutexGuard<'_, HashSet<FeedSource>> {
        self.started.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Feeds {
    fn drop(&mut self) {
        self.shutdown();
    }
}
