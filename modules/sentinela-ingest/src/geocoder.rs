// Nominatim (OpenStreetMap) geocoder.
//
// Answers are cached per query string, misses included, so repeated passes
// over the same unresolvable address do not hit the service again. Outbound
// requests are serialized with a minimum gap between them to respect the
// public instance's usage policy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use sentinela_common::{Coordinates, ExpiringCache};
use sentinela_sources::{FetchError, HttpFetcher};

use crate::traits::Geocoder;

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// First hit of a search response, if it carries a usable pair.
fn parse_response(query: &str, body: &str) -> std::result::Result<Option<Coordinates>, FetchError> {
    let hits: Vec<NominatimResponse> =
        serde_json::from_str(body).map_err(|e| FetchError::Parse(format!("geocoder: {e}")))?;

    let Some(hit) = hits.first() else {
        return Ok(None);
    };
    let (Ok(lat), Ok(lon)) = (hit.lat.trim().parse::<f64>(), hit.lon.trim().parse::<f64>()) else {
        warn!(query, lat = %hit.lat, lon = %hit.lon, "Geocoder returned unparsable coordinates");
        return Ok(None);
    };

    let coordinates = Coordinates::new(lat, lon);
    if !coordinates.is_valid() {
        return Ok(None);
    }
    debug!(
        query,
        lat,
        lon,
        display_name = hit.display_name.as_deref().unwrap_or(""),
        "Geocoded"
    );
    Ok(Some(coordinates))
}

/// Serializes calls and keeps at least `min_gap` between the end of one
/// and the start of the next.
pub struct RequestSpacer {
    min_gap: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last: Mutex::new(None),
        }
    }

    pub async fn run<F, T>(&self, request: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.min_gap).await;
        }
        let out = request.await;
        *last = Some(Instant::now());
        out
    }
}

struct NominatimInner {
    fetcher: Arc<dyn HttpFetcher>,
    search_url: String,
    spacer: RequestSpacer,
}

pub struct NominatimGeocoder {
    inner: Arc<NominatimInner>,
    cache: ExpiringCache<String, Option<Coordinates>, FetchError>,
}

impl NominatimGeocoder {
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        search_url: impl Into<String>,
        spacing: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(NominatimInner {
                fetcher,
                search_url: search_url.into(),
                spacer: RequestSpacer::new(spacing),
            }),
            cache: ExpiringCache::new(cache_ttl),
        }
    }

    /// Search URL for `query`, restricted to Peru.
    pub fn query_url(&self, query: &str) -> std::result::Result<String, FetchError> {
        self.inner.query_url(query)
    }
}

impl NominatimInner {
    fn query_url(&self, query: &str) -> std::result::Result<String, FetchError> {
        reqwest::Url::parse_with_params(
            &self.search_url,
            &[
                ("q", query),
                ("format", "jsonv2"),
                ("limit", "1"),
                ("countrycodes", "pe"),
            ],
        )
        .map(|url| url.to_string())
        .map_err(|e| FetchError::Parse(format!("geocoder url: {e}")))
    }

    async fn lookup(&self, query: &str) -> std::result::Result<Option<Coordinates>, FetchError> {
        let url = self.query_url(query)?;
        let body = self
            .spacer
            .run(self.fetcher.get_text(&url, None))
            .await?;
        parse_response(query, &body)
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>> {
        let inner = self.inner.clone();
        let key = query.to_string();
        let owned = key.clone();
        let found = self
            .cache
            .get_or_fetch(key, move || async move { inner.lookup(&owned).await })
            .await?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinela_sources::testing::MockFetcher;

    const SEARCH: &str = "https://geocoder.test/search";

    fn geocoder(fetcher: Arc<MockFetcher>, spacing: Duration) -> NominatimGeocoder {
        NominatimGeocoder::new(fetcher, SEARCH, spacing, Duration::from_secs(3600))
    }

    #[test]
    fn parses_first_hit() {
        let body = r#"[{"lat":"-12.0464","lon":"-77.0428","display_name":"Lima, Perú"},
                       {"lat":"1","lon":"1"}]"#;
        assert_eq!(
            parse_response("Lima, Peru", body).unwrap(),
            Some(Coordinates::new(-12.0464, -77.0428))
        );
    }

    #[test]
    fn empty_or_placeholder_hits_are_no_match() {
        assert_eq!(parse_response("x", "[]").unwrap(), None);
        assert_eq!(parse_response("x", r#"[{"lat":"0","lon":"0"}]"#).unwrap(), None);
        assert_eq!(parse_response("x", r#"[{"lat":"abc","lon":"-77"}]"#).unwrap(), None);
        assert!(parse_response("x", "<html>").is_err());
    }

    #[test]
    fn query_url_restricts_to_peru() {
        let g = geocoder(Arc::new(MockFetcher::new()), Duration::ZERO);
        let url = reqwest::Url::parse(&g.query_url("Miraflores, Lima, Peru").unwrap()).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["q"], "Miraflores, Lima, Peru");
        assert_eq!(pairs["countrycodes"], "pe");
        assert_eq!(pairs["limit"], "1");
    }

    #[tokio::test]
    async fn answers_and_misses_are_cached() {
        let probe = geocoder(Arc::new(MockFetcher::new()), Duration::ZERO);
        let hit_url = probe.query_url("Callao, Peru").unwrap();
        let miss_url = probe.query_url("Nowhere, Peru").unwrap();

        let fetcher = Arc::new(
            MockFetcher::new()
                .on_text(&hit_url, r#"[{"lat":"-12.05","lon":"-77.12"}]"#)
                .on_text(&miss_url, "[]"),
        );
        let g = geocoder(fetcher.clone(), Duration::ZERO);

        for _ in 0..3 {
            assert_eq!(
                g.geocode("Callao, Peru").await.unwrap(),
                Some(Coordinates::new(-12.05, -77.12))
            );
            assert_eq!(g.geocode("Nowhere, Peru").await.unwrap(), None);
        }
        assert_eq!(fetcher.calls_to(&hit_url), 1);
        assert_eq!(fetcher.calls_to(&miss_url), 1);
    }

    #[tokio::test]
    async fn failures_are_retried_on_next_call() {
        let probe = geocoder(Arc::new(MockFetcher::new()), Duration::ZERO);
        let url = probe.query_url("Ica, Peru").unwrap();
        let fetcher = Arc::new(
            MockFetcher::new()
                .then(&url, Err(sentinela_sources::testing::transient(&url)))
                .on_text(&url, r#"[{"lat":"-14.07","lon":"-75.73"}]"#),
        );
        let g = geocoder(fetcher.clone(), Duration::ZERO);

        assert!(g.geocode("Ica, Peru").await.is_err());
        assert!(g.geocode("Ica, Peru").await.unwrap().is_some());
        assert_eq!(fetcher.calls_to(&url), 2);
    }

    #[tokio::test]
    async fn requests_are_spaced() {
        let gap = Duration::from_millis(40);
        let spacer = RequestSpacer::new(gap);

        let started = Instant::now();
        spacer.run(async {}).await;
        spacer.run(async {}).await;
        spacer.run(async {}).await;

        assert!(started.elapsed() >= gap * 2);
    }
}
