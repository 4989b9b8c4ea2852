// Scraped fire-department incident table.
//
// The portal blocks and rate-limits aggressively. Attempt 1 always goes
// direct; later attempts route through a not-yet-tried proxy from the pool
// and fall back to direct when the pool has nothing new to offer. The first
// attempt that yields at least one row wins.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sentinela_common::FeedSource;

use crate::client::{RawRecord, SourceClient};
use crate::error::{FetchError, Result};
use crate::http::HttpFetcher;
use crate::proxy_pool::ProxyPool;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_MAX_PROXY_DRAWS: usize = 10;

static ROW: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table tr").expect("Invalid row selector"));
static HEADER_CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th").expect("Invalid header selector"));
static DATA_CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td").expect("Invalid cell selector"));

/// One incident row exactly as the portal prints it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireRow {
    /// Incident report number ("parte"); the natural key.
    pub number: String,
    /// Zone-less 12-hour local timestamp, e.g. `18/10/2026 03:45:12 p. m.`
    pub reported_at: String,
    /// Free-text address, sometimes carrying a `(lat,lon)` pair.
    pub location: String,
    pub category: String,
    pub status: Option<String>,
    /// Dispatched units, as listed.
    pub vehicles: Option<String>,
}

pub struct FireClient {
    fetcher: Arc<dyn HttpFetcher>,
    proxies: Option<ProxyPool>,
    url: String,
    max_attempts: u32,
    backoff: Duration,
    max_proxy_draws: usize,
}

impl FireClient {
    pub fn new(fetcher: Arc<dyn HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            proxies: None,
            url: url.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            max_proxy_draws: DEFAULT_MAX_PROXY_DRAWS,
        }
    }

    pub fn with_proxies(mut self, pool: ProxyPool) -> Self {
        self.proxies = Some(pool);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Base delay; the wait after attempt `n` is `backoff * n`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_proxy_draws(mut self, draws: usize) -> Self {
        self.max_proxy_draws = draws;
        self
    }

    /// Fetch and parse the incident table, retrying with proxy rotation.
    pub async fn fetch_rows(&self) -> Result<Vec<FireRow>> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last = String::from("no attempt made");

        for attempt in 1..=self.max_attempts {
            let proxy = if attempt == 1 {
                None
            } else {
                self.pick_proxy(&mut tried)
            };
            let route = proxy.as_deref().unwrap_or("direct");

            match self.fetcher.get_text(&self.url, proxy.as_deref()).await {
                Ok(body) => {
                    let rows = parse_incident_table(&body);
                    if !rows.is_empty() {
                        info!(attempt, route, rows = rows.len(), "Fire incident table fetched");
                        return Ok(rows);
                    }
                    last = "response contained no incident rows".to_string();
                    warn!(attempt, route, "Fire portal returned no rows");
                }
                Err(e) => {
                    warn!(attempt, route, error = %e, "Fire portal fetch failed");
                    last = e.to_string();
                }
            }

            if attempt < self.max_attempts {
                let delay = self.backoff * attempt;
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }
        }

        Err(FetchError::Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }

    /// Draw a proxy not used earlier in this fetch. `None` means direct.
    fn pick_proxy(&self, tried: &mut HashSet<String>) -> Option<String> {
        let pool = self.proxies.as_ref()?;
        for _ in 0..self.max_proxy_draws {
            let candidate = pool.get_random()?;
            if tried.insert(candidate.clone()) {
                return Some(candidate);
            }
        }
        debug!("No untried proxy found, falling back to direct");
        None
    }
}

#[async_trait]
impl SourceClient for FireClient {
    fn source(&self) -> FeedSource {
        FeedSource::FireIncidents
    }

    async fn fetch(&self) -> Result<Vec<RawRecord>> {
        let rows = self.fetch_rows().await?;
        Ok(rows.into_iter().map(RawRecord::Fire).collect())
    }
}

// --- Table parsing ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Number,
    ReportedAt,
    Location,
    Category,
    Status,
    Vehicles,
}

/// Column order when the table has no recognizable header.
const DEFAULT_LAYOUT: [Column; 6] = [
    Column::Number,
    Column::ReportedAt,
    Column::Location,
    Column::Category,
    Column::Status,
    Column::Vehicles,
];

fn classify_header(text: &str) -> Option<Column> {
    let t = text.to_lowercase();
    if t.contains("parte") || t.contains("nro") || t.contains("nº") || t.contains("n°") {
        Some(Column::Number)
    } else if t.contains("fecha") {
        Some(Column::ReportedAt)
    } else if t.contains("direc") || t.contains("ubica") {
        Some(Column::Location)
    } else if t.contains("tipo") || t.contains("emergencia") {
        Some(Column::Category)
    } else if t.contains("estado") {
        Some(Column::Status)
    } else if t.contains("quina") || t.contains("unidad") || t.contains("vehic") {
        Some(Column::Vehicles)
    } else {
        None
    }
}

/// Map of column → cell index. Needs at least the four required columns.
fn header_layout(cells: &[String]) -> Option<HashMap<Column, usize>> {
    let mut layout = HashMap::new();
    for (idx, text) in cells.iter().enumerate() {
        if let Some(col) = classify_header(text) {
            layout.entry(col).or_insert(idx);
        }
    }
    let required = [
        Column::Number,
        Column::ReportedAt,
        Column::Location,
        Column::Category,
    ];
    required
        .iter()
        .all(|c| layout.contains_key(c))
        .then_some(layout)
}

fn default_layout() -> HashMap<Column, usize> {
    DEFAULT_LAYOUT
        .iter()
        .enumerate()
        .map(|(idx, col)| (*col, idx))
        .collect()
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Parse every incident row out of the portal's HTML. Header rows (either
/// `<th>` cells or a `<td>` row whose cells read as column titles) set the
/// column layout; rows too short for that layout, or with no report
/// number, are skipped.
pub fn parse_incident_table(html: &str) -> Vec<FireRow> {
    let document = Html::parse_document(html);
    let mut layout = default_layout();
    let mut rows = Vec::new();

    for tr in document.select(&ROW) {
        let headers: Vec<String> = tr.select(&HEADER_CELL).map(cell_text).collect();
        if !headers.is_empty() {
            if let Some(found) = header_layout(&headers) {
                layout = found;
            }
            continue;
        }

        let cells: Vec<String> = tr.select(&DATA_CELL).map(cell_text).collect();
        if let Some(found) = header_layout(&cells) {
            layout = found;
            continue;
        }

        match row_from_cells(&cells, &layout) {
            Some(row) => rows.push(row),
            None if !cells.is_empty() => debug!(cells = cells.len(), "Skipping unparsable row"),
            None => {}
        }
    }

    rows
}

fn row_from_cells(cells: &[String], layout: &HashMap<Column, usize>) -> Option<FireRow> {
    let get = |col: Column| layout.get(&col).and_then(|idx| cells.get(*idx));

    let number = get(Column::Number)?.trim().trim_start_matches('#').trim().to_string();
    if number.is_empty() {
        return None;
    }

    Some(FireRow {
        number,
        reported_at: get(Column::ReportedAt)?.clone(),
        location: get(Column::Location)?.clone(),
        category: get(Column::Category)?.clone(),
        status: non_empty(get(Column::Status)),
        vehicles: non_empty(get(Column::Vehicles)),
    })
}
