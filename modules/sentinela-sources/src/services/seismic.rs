use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use sentinela_common::{time::source_today, EarthquakeLinks, FeedSource};

use super::{de_opt_f64, de_opt_string};
use crate::client::{RawRecord, SourceClient};
use crate::error::{FetchError, Result};
use crate::http::{get_json, HttpFetcher};

/// One event as published by the seismological API. Dates and times arrive
/// split: `fecha_utc` carries the day, `hora_utc` the clock time anchored to
/// a placeholder date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeismicEvent {
    #[serde(rename = "codigo", default, deserialize_with = "de_opt_string")]
    pub code: Option<String>,
    #[serde(rename = "fecha_utc", default, deserialize_with = "de_opt_string")]
    pub utc_date: Option<String>,
    #[serde(rename = "hora_utc", default, deserialize_with = "de_opt_string")]
    pub utc_time: Option<String>,
    #[serde(rename = "fecha_local", default, deserialize_with = "de_opt_string")]
    pub local_date: Option<String>,
    #[serde(rename = "hora_local", default, deserialize_with = "de_opt_string")]
    pub local_time: Option<String>,
    #[serde(rename = "latitud", default, deserialize_with = "de_opt_f64")]
    pub latitude: Option<f64>,
    #[serde(rename = "longitud", default, deserialize_with = "de_opt_f64")]
    pub longitude: Option<f64>,
    #[serde(rename = "magnitud", default, deserialize_with = "de_opt_f64")]
    pub magnitude: Option<f64>,
    #[serde(rename = "tipomagnitud", default, deserialize_with = "de_opt_string")]
    pub magnitude_type: Option<String>,
    #[serde(rename = "profundidad", default, deserialize_with = "de_opt_f64")]
    pub depth_km: Option<f64>,
    #[serde(rename = "intensidad", default, deserialize_with = "de_opt_string")]
    pub intensity: Option<String>,
    #[serde(rename = "referencia", default, deserialize_with = "de_opt_string")]
    pub reference: Option<String>,

    #[serde(rename = "reporte_acelerometrico_pdf", default, deserialize_with = "de_opt_string")]
    pub report_pdf: Option<String>,
    #[serde(rename = "mapa_acelerometrico", default, deserialize_with = "de_opt_string")]
    pub accelerometric_map: Option<String>,
    #[serde(rename = "mapa_intensidad", default, deserialize_with = "de_opt_string")]
    pub intensity_map: Option<String>,
    #[serde(rename = "mapa_tematico", default, deserialize_with = "de_opt_string")]
    pub thematic_map: Option<String>,
    #[serde(rename = "mapa_sacudimiento", default, deserialize_with = "de_opt_string")]
    pub shake_map: Option<String>,
    #[serde(rename = "informe_tecnico", default, deserialize_with = "de_opt_string")]
    pub technical_report: Option<String>,

    /// The untouched object, kept for the audit payload.
    #[serde(skip)]
    pub raw: Value,
}

impl SeismicEvent {
    fn from_value(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let mut event: SeismicEvent = serde_json::from_value(value.clone()).ok()?;
        event.raw = value;
        Some(event)
    }

    pub fn links(&self) -> EarthquakeLinks {
        EarthquakeLinks {
            report_pdf: self.report_pdf.clone(),
            accelerometric_map: self.accelerometric_map.clone(),
            intensity_map: self.intensity_map.clone(),
            thematic_map: self.thematic_map.clone(),
            shake_map: self.shake_map.clone(),
            technical_report: self.technical_report.clone(),
        }
    }
}

/// Client for the seismological REST API. One GET per call, no retries:
/// a failed fetch is left to the next scheduled cycle.
pub struct SeismicClient {
    fetcher: Arc<dyn HttpFetcher>,
    /// Contains `{year}`.
    year_url: String,
    /// Contains `{code}`.
    detail_url: String,
}

impl SeismicClient {
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        year_url: impl Into<String>,
        detail_url: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            year_url: year_url.into(),
            detail_url: detail_url.into(),
        }
    }

    pub async fn fetch_year(&self, year: i32) -> Result<Vec<SeismicEvent>> {
        let url = self.year_url.replace("{year}", &year.to_string());
        let body: Value = get_json(self.fetcher.as_ref(), &url).await?;

        let items = match body {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("data") {
                Some(Value::Array(items)) => items,
                _ => return Err(FetchError::parse(&url, "expected an event list")),
            },
            _ => return Err(FetchError::parse(&url, "expected an event list")),
        };

        let total = items.len();
        let events: Vec<SeismicEvent> = items.into_iter().filter_map(SeismicEvent::from_value).collect();
        if events.len() < total {
            warn!(year, skipped = total - events.len(), "Skipped non-object seismic entries");
        }
        info!(year, count = events.len(), "Seismic events fetched");
        Ok(events)
    }

    /// Detail lookup by event code. `Ok(None)` when the API knows no such event.
    pub async fn fetch_detail(&self, code: &str) -> Result<Option<SeismicEvent>> {
        let url = self.detail_url.replace("{code}", code);
        let body: Value = get_json(self.fetcher.as_ref(), &url).await?;

        let body = match body {
            Value::Object(mut obj) if obj.contains_key("data") => obj.remove("data").unwrap_or_default(),
            other => other,
        };
        let item = match body {
            Value::Array(items) => items.into_iter().next(),
            Value::Null => None,
            other => Some(other),
        };
        Ok(item.and_then(SeismicEvent::from_value))
    }
}

#[async_trait]
impl SourceClient for SeismicClient {
    fn source(&self) -> FeedSource {
        FeedSource::Earthquakes
    }

    /// Events for the current year in the source timezone.
    async fn fetch(&self) -> Result<Vec<RawRecord>> {
        let year = source_today(Utc::now()).year();
        let events = self.fetch_year(year).await?;
        Ok(events.into_iter().map(RawRecord::Earthquake).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetcher;
    use serde_json::json;

    const YEAR_URL: &str = "https://seismic.test/api/sismos/{year}";
    const DETAIL_URL: &str = "https://seismic.test/api/sismo/{code}";

    fn event_json() -> Value {
        json!({
            "codigo": "2026-0451",
            "fecha_utc": "2026-10-17T00:00:00.000Z",
            "hora_utc": "1970-01-01T10:20:25.000Z",
            "fecha_local": "2026-10-17T00:00:00.000Z",
            "hora_local": "1970-01-01T05:20:25.000Z",
            "latitud": "-12.35",
            "longitud": -77.12,
            "magnitud": "4.2",
            "tipomagnitud": "ML",
            "profundidad": 48,
            "intensidad": "III Lima",
            "referencia": "28 km al SO de Lima, Lima",
            "mapa_intensidad": "https://seismic.test/maps/2026-0451.png",
            "informe_tecnico": ""
        })
    }

    fn client(fetcher: MockFetcher) -> SeismicClient {
        SeismicClient::new(Arc::new(fetcher), YEAR_URL, DETAIL_URL)
    }

    #[tokio::test]
    async fn fetch_year_decodes_loose_fields() {
        let body = json!([event_json(), "garbage"]).to_string();
        let client = client(MockFetcher::new().on_text("https://seismic.test/api/sismos/2026", body));

        let events = client.fetch_year(2026).await.unwrap();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.code.as_deref(), Some("2026-0451"));
        assert_eq!(e.latitude, Some(-12.35));
        assert_eq!(e.magnitude, Some(4.2));
        assert_eq!(e.depth_km, Some(48.0));
        assert_eq!(e.utc_time.as_deref(), Some("1970-01-01T10:20:25.000Z"));
        assert_eq!(e.raw, event_json());

        let links = e.links();
        assert_eq!(links.intensity_map.as_deref(), Some("https://seismic.test/maps/2026-0451.png"));
        assert_eq!(links.technical_report, None);
        assert_eq!(links.missing(), 5);
    }

    #[tokio::test]
    async fn fetch_year_accepts_data_envelope() {
        let body = json!({ "data": [event_json()] }).to_string();
        let client = client(MockFetcher::new().on_text("https://seismic.test/api/sismos/2025", body));
        assert_eq!(client.fetch_year(2025).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_year_rejects_unexpected_shape() {
        let client = client(
            MockFetcher::new().on_text("https://seismic.test/api/sismos/2026", r#"{"error":"down"}"#),
        );
        assert!(matches!(client.fetch_year(2026).await, Err(FetchError::Parse(_))));
    }

    #[tokio::test]
    async fn fetch_detail_handles_object_and_empty() {
        let client = client(
            MockFetcher::new()
                .on_text("https://seismic.test/api/sismo/2026-0451", event_json().to_string())
                .on_text("https://seismic.test/api/sismo/missing", "[]"),
        );

        let found = client.fetch_detail("2026-0451").await.unwrap();
        assert_eq!(found.and_then(|e| e.code).as_deref(), Some("2026-0451"));
        assert_eq!(client.fetch_detail("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn transport_errors_propagate_without_retry() {
        let fetcher = Arc::new(MockFetcher::new());
        let client = SeismicClient::new(fetcher.clone(), YEAR_URL, DETAIL_URL);
        assert!(client.fetch_year(2026).await.unwrap_err().is_transient());
        assert_eq!(fetcher.calls_to("https://seismic.test/api/sismos/2026"), 1);
    }
}
