// Civil-defense emergency feed (ArcGIS feature query).
//
// The query is filtered server-side to emergencies dated since yesterday
// (source timezone). Features arrive either as ArcGIS JSON
// (`attributes` + `geometry {x, y}`) or GeoJSON (`properties` +
// `geometry.coordinates [lon, lat]`); both collapse into EmergencyFeature.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use sentinela_common::{time::source_today, FeedSource, EMERGENCY_IDENTITY_FIELDS};

use super::{value_as_f64, value_as_string};
use crate::client::{RawRecord, SourceClient};
use crate::error::{FetchError, Result};
use crate::http::{get_json, HttpFetcher};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyFeature {
    /// Attribute map with keys upper-cased.
    pub attributes: Map<String, Value>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

impl EmergencyFeature {
    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key).filter(|v| !v.is_null())
    }

    /// First non-blank text value among `keys`.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.attr(k).and_then(value_as_string))
    }

    /// First numeric value among `keys`.
    pub fn number(&self, keys: &[&str]) -> Option<f64> {
        keys.iter().find_map(|k| self.attr(k).and_then(value_as_f64))
    }

    /// The provider identity, when present.
    pub fn identity(&self) -> Option<String> {
        self.text(&EMERGENCY_IDENTITY_FIELDS)
    }

    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let attributes: Map<String, Value> = obj
            .get("attributes")
            .or_else(|| obj.get("properties"))
            .and_then(Value::as_object)?
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v.clone()))
            .collect();

        let (longitude, latitude) = obj.get("geometry").map(geometry_point).unwrap_or_default();

        Some(Self {
            attributes,
            longitude,
            latitude,
        })
    }
}

/// `(lon, lat)` from either ArcGIS `{x, y}` or GeoJSON point coordinates.
fn geometry_point(geometry: &Value) -> (Option<f64>, Option<f64>) {
    if let (Some(x), Some(y)) = (geometry.get("x"), geometry.get("y")) {
        return (value_as_f64(x), value_as_f64(y));
    }
    match geometry.get("coordinates").and_then(Value::as_array) {
        Some(coords) if coords.len() >= 2 => (value_as_f64(&coords[0]), value_as_f64(&coords[1])),
        _ => (None, None),
    }
}

/// Decode a feature-query response. A service error object, or a body
/// with no feature list, is a parse error.
pub fn parse_features(context: &str, body: &Value) -> Result<Vec<EmergencyFeature>> {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("service error");
        return Err(FetchError::parse(context, message));
    }
    let features = body
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::parse(context, "missing features array"))?;

    Ok(features.iter().filter_map(EmergencyFeature::from_value).collect())
}

pub struct CivilDefenseClient {
    fetcher: Arc<dyn HttpFetcher>,
    query_url: String,
}

impl CivilDefenseClient {
    pub fn new(fetcher: Arc<dyn HttpFetcher>, query_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            query_url: query_url.into(),
        }
    }

    /// Query URL selecting emergencies dated on or after yesterday.
    pub fn query_url(&self, now: DateTime<Utc>) -> Result<String> {
        let since = source_today(now) - Duration::days(1);
        let filter = format!("FECHA >= DATE '{}'", since.format("%Y-%m-%d"));
        let url = reqwest::Url::parse_with_params(
            &self.query_url,
            &[
                ("where", filter.as_str()),
                ("outFields", "*"),
                ("returnGeometry", "true"),
                ("outSR", "4326"),
                ("f", "json"),
            ],
        )
        .map_err(|e| FetchError::parse(&self.query_url, e))?;
        Ok(url.to_string())
    }

    pub async fn fetch_features(&self, now: DateTime<Utc>) -> Result<Vec<EmergencyFeature>> {
        let url = self.query_url(now)?;
        let body: Value = get_json(self.fetcher.as_ref(), &url).await?;
        let features = parse_features(&url, &body)?;
        info!(count = features.len(), "Civil-defense emergencies fetched");
        Ok(features)
    }
}

#[async_trait]
impl SourceClient for CivilDefenseClient {
    fn source(&self) -> FeedSource {
        FeedSource::Emergencies
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>> {
        let features = self.fetch_features(Utc::now()).await?;
        Ok(features.into_iter().map(RawRecord::Emergency).collect())
    }
}
