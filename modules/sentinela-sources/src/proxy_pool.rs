// Rotating forward-proxy pool used only by the scraped fire-incident source.
//
// The cache is replaced wholesale on a successful refresh and left alone on
// failure, so a flaky directory never empties a working pool. Concurrent
// refresh calls collapse into one directory request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use sentinela_common::SingleFlight;

use crate::error::{FetchError, Result};
use crate::http::HttpFetcher;

#[derive(Debug, Clone)]
pub struct ProxyPoolSettings {
    pub directory_url: String,
    /// Entries slower than this (directory-reported latency) are dropped.
    pub max_latency_ms: f64,
    /// Upper bound on cached proxies.
    pub cap: usize,
}

/// One entry as published by the proxy directory.
#[derive(Debug, Clone, Deserialize)]
struct DirectoryEntry {
    proxy: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    #[serde(default)]
    alive: bool,
    /// Reported latency in milliseconds.
    timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    proxies: Vec<DirectoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyPoolStatus {
    pub count: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub is_refreshing: bool,
    pub failed_refreshes: u64,
}

#[derive(Default)]
struct ProxyCache {
    proxies: Vec<String>,
    last_update: Option<DateTime<Utc>>,
}

struct PoolInner {
    fetcher: Arc<dyn HttpFetcher>,
    settings: ProxyPoolSettings,
    cache: ArcSwap<ProxyCache>,
    flights: SingleFlight<(), usize, FetchError>,
    refreshing: AtomicBool,
    failed_refreshes: AtomicU64,
}

#[derive(Clone)]
pub struct ProxyPool {
    inner: Arc<PoolInner>,
}

impl ProxyPool {
    pub fn new(fetcher: Arc<dyn HttpFetcher>, settings: ProxyPoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                fetcher,
                settings,
                cache: ArcSwap::from_pointee(ProxyCache::default()),
                flights: SingleFlight::new(),
                refreshing: AtomicBool::new(false),
                failed_refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch the directory and replace the cache. Returns the new pool size.
    /// On failure the previous cache is kept.
    pub async fn refresh(&self) -> Result<usize> {
        let inner = self.inner.clone();
        self.inner
            .flights
            .run((), async move { inner.refresh_once().await })
            .await
    }

    /// Uniform random draw. `None` means "connect directly".
    pub fn get_random(&self) -> Option<String> {
        let cache = self.inner.cache.load();
        if cache.proxies.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..cache.proxies.len());
        cache.proxies.get(idx).cloned()
    }

    pub fn status(&self) -> ProxyPoolStatus {
        let cache = self.inner.cache.load();
        ProxyPoolStatus {
            count: cache.proxies.len(),
            last_update: cache.last_update,
            is_refreshing: self.inner.refreshing.load(Ordering::SeqCst),
            failed_refreshes: self.inner.failed_refreshes.load(Ordering::SeqCst),
        }
    }

    /// Refresh now, then every `interval`, independent of source activity.
    pub fn spawn_refresh_loop(&self, interval: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = pool.refresh().await {
                    warn!(error = %e, "Proxy refresh failed, keeping previous pool");
                }
            }
        })
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn seeded(fetcher: Arc<dyn HttpFetcher>, settings: ProxyPoolSettings, proxies: Vec<String>) -> Self {
        let pool = Self::new(fetcher, settings);
        pool.inner.replace(proxies);
        pool
    }
}

impl PoolInner {
    fn replace(&self, proxies: Vec<String>) {
        self.cache.store(Arc::new(ProxyCache {
            proxies,
            last_update: Some(Utc::now()),
        }));
    }

    async fn refresh_once(&self) -> Result<usize> {
        self.refreshing.store(true, Ordering::SeqCst);
        let result = self.fetch_usable().await;
        self.refreshing.store(false, Ordering::SeqCst);

        match result {
            Ok(proxies) => {
                let count = proxies.len();
                self.replace(proxies);
                info!(count, "Proxy pool refreshed");
                Ok(count)
            }
            Err(e) => {
                self.failed_refreshes.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn fetch_usable(&self) -> Result<Vec<String>> {
        let url = &self.settings.directory_url;
        let body = self.fetcher.get_text(url, None).await?;
        let response: DirectoryResponse =
            serde_json::from_str(&body).map_err(|e| FetchError::parse("proxy directory", e))?;
        Ok(select_usable(
            response.proxies,
            self.settings.max_latency_ms,
            self.settings.cap,
        ))
    }
}

fn select_usable(entries: Vec<DirectoryEntry>, max_latency_ms: f64, cap: usize) -> Vec<String> {
    let mut usable: Vec<(f64, String)> = entries
        .into_iter()
        .filter(|e| e.alive)
        .filter_map(|e| {
            let latency = e.timeout.filter(|t| t.is_finite() && *t < max_latency_ms)?;
            let address = match (e.proxy, e.ip, e.port) {
                (Some(p), _, _) if !p.trim().is_empty() => p.trim().to_string(),
                (_, Some(ip), Some(port)) => format!("{ip}:{port}"),
                _ => return None,
            };
            let address = if address.contains("://") {
                address
            } else {
                format!("http://{address}")
            };
            Some((latency, address))
        })
        .collect();

    usable.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut seen = std::collections::HashSet::new();
    usable
        .into_iter()
        .map(|(_, address)| address)
        .filter(|address| seen.insert(address.clone()))
        .take(cap)
        .collect()
}
