use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::types::FeedSource;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Endpoints
    pub fire_feed_url: String,
    pub seismic_year_url: String,
    pub seismic_detail_url: String,
    pub civil_defense_query_url: String,
    pub proxy_directory_url: String,
    pub geocoder_url: String,
    pub geocoder_user_agent: String,

    // HTTP
    pub http_timeout: Duration,

    // Scraped source retries
    pub fire_max_attempts: u32,
    pub fire_backoff: Duration,
    pub proxy_max_draws: u32,

    // Proxy pool
    pub proxy_refresh_interval: Duration,
    pub proxy_max_latency_ms: f64,
    pub proxy_pool_cap: usize,

    // Scheduling
    pub fire_update_interval: Duration,
    pub earthquake_update_interval: Duration,
    pub emergency_update_interval: Duration,

    // Geocode backfill
    pub backfill_interval: Duration,
    pub backfill_batch: i64,
    pub geocoder_spacing: Duration,
    pub geocoder_cache_ttl: Duration,

    // Earthquake detail enrichment
    pub enrich_batch: i64,
}

impl Config {
    /// Load configuration from the environment (and `.env` when present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: database_url_from_env()?,
            database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,

            fire_feed_url: string_env(
                "FIRE_FEED_URL",
                "https://sgonorte.bomberosperu.gob.pe/24horas",
            ),
            seismic_year_url: string_env(
                "SEISMIC_YEAR_URL",
                "https://ultimosismo.igp.gob.pe/api/ultimo-sismo/ajaxb/{year}",
            ),
            seismic_detail_url: string_env(
                "SEISMIC_DETAIL_URL",
                "https://ultimosismo.igp.gob.pe/api/ultimo-sismo/ajaxb/sismo/{code}",
            ),
            civil_defense_query_url: string_env(
                "CIVIL_DEFENSE_QUERY_URL",
                "https://geosinpad.indeci.gob.pe/indeci/rest/services/Emergencias/EMERGENCIAS_SINPAD/FeatureServer/0/query",
            ),
            proxy_directory_url: string_env(
                "PROXY_DIRECTORY_URL",
                "https://api.proxyscrape.com/v4/free-proxy-list/get?request=display_proxies&proxy_format=protocolipport&format=json&protocol=http",
            ),
            geocoder_url: string_env(
                "GEOCODER_URL",
                "https://nominatim.openstreetmap.org/search",
            ),
            geocoder_user_agent: string_env(
                "GEOCODER_USER_AGENT",
                "sentinela/0.1 (incident feed geocoding)",
            ),

            http_timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS", 30)?),

            fire_max_attempts: parse_env("FIRE_MAX_ATTEMPTS", 5)?,
            fire_backoff: Duration::from_millis(parse_env("FIRE_BACKOFF_MS", 2000)?),
            proxy_max_draws: parse_env("PROXY_MAX_DRAWS", 10)?,

            proxy_refresh_interval: minutes(parse_env("PROXY_REFRESH_MINUTES", 60)?),
            proxy_max_latency_ms: parse_env("PROXY_MAX_LATENCY_MS", 1000.0)?,
            proxy_pool_cap: parse_env("PROXY_POOL_CAP", 50)?,

            fire_update_interval: minutes(parse_env("FIRE_UPDATE_INTERVAL_MINUTES", 5)?),
            earthquake_update_interval: minutes(parse_env(
                "EARTHQUAKE_UPDATE_INTERVAL_MINUTES",
                10,
            )?),
            emergency_update_interval: minutes(parse_env(
                "EMERGENCY_UPDATE_INTERVAL_MINUTES",
                15,
            )?),

            backfill_interval: minutes(parse_env("BACKFILL_INTERVAL_MINUTES", 10)?),
            backfill_batch: parse_env("BACKFILL_BATCH", 25)?,
            geocoder_spacing: Duration::from_millis(parse_env("GEOCODER_SPACING_MS", 1100)?),
            geocoder_cache_ttl: Duration::from_secs(
                parse_env::<u64>("GEOCODER_CACHE_HOURS", 24)? * 3600,
            ),

            enrich_batch: parse_env("ENRICH_BATCH", 10)?,
        };

        if config.fire_max_attempts == 0 {
            anyhow::bail!("FIRE_MAX_ATTEMPTS must be at least 1");
        }

        Ok(config)
    }

    pub fn update_interval(&self, source: FeedSource) -> Duration {
        match source {
            FeedSource::FireIncidents => self.fire_update_interval,
            FeedSource::Earthquakes => self.earthquake_update_interval,
            FeedSource::Emergencies => self.emergency_update_interval,
        }
    }

    /// Log the loaded configuration with credentials masked.
    pub fn log_redacted(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", redact_url(&self.database_url));
        tracing::info!("  FIRE_FEED_URL: {}", self.fire_feed_url);
        tracing::info!("  SEISMIC_YEAR_URL: {}", self.seismic_year_url);
        tracing::info!("  CIVIL_DEFENSE_QUERY_URL: {}", self.civil_defense_query_url);
        tracing::info!("  PROXY_DIRECTORY_URL: {}", self.proxy_directory_url);
        tracing::info!("  GEOCODER_URL: {}", self.geocoder_url);
        tracing::info!(
            "  intervals: fires={}s earthquakes={}s emergencies={}s backfill={}s",
            self.fire_update_interval.as_secs(),
            self.earthquake_update_interval.as_secs(),
            self.emergency_update_interval.as_secs(),
            self.backfill_interval.as_secs()
        );
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn string_env(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        _ => Ok(default),
    }
}

/// `DATABASE_URL` wins; otherwise assemble one from the libpq-style `PG*` vars.
fn database_url_from_env() -> Result<String> {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return Ok(url);
        }
    }

    let host = env::var("PGHOST").context("DATABASE_URL or PGHOST environment variable is required")?;
    let port = string_env("PGPORT", "5432");
    let user = string_env("PGUSER", "postgres");
    let password = env::var("PGPASSWORD").unwrap_or_default();
    let database = string_env("PGDATABASE", "sentinela");

    Ok(build_database_url(&host, &port, &user, &password, &database))
}

fn build_database_url(host: &str, port: &str, user: &str, password: &str, database: &str) -> String {
    if password.is_empty() {
        format!("postgres://{user}@{host}:{port}/{database}")
    } else {
        format!("postgres://{user}:{password}@{host}:{port}/{database}")
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let creds = &url[scheme_end + 3..at];
            let user = creds.split(':').next().unwrap_or("");
            format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..])
        }
        _ => url.to_string(),
    }
}
