// Postgres persistence for the three feed tables.
//
// Every write is a standalone idempotent statement keyed by the source's
// natural key; batches are not wrapped in a transaction, so an interrupted
// batch leaves a partial write that the next cycle repairs.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use sentinela_common::{
    EarthquakeLinks, FeedRecord, FeedSource, NewRecord, QueryWindow, RecordDetails, StoredRecord,
    UpsertReport, EMERGENCY_IDENTITY_FIELDS,
};

use crate::error::{Result, StoreError};

/// Rows whose coordinate pair is unusable. NaN sorts above every number in
/// Postgres, so the range checks also catch it.
const INVALID_COORDS: &str = "(latitude IS NULL OR longitude IS NULL \
     OR latitude NOT BETWEEN -90 AND 90 OR longitude NOT BETWEEN -180 AND 180 \
     OR (latitude = 0 AND longitude = 0))";

/// Rows whose location text still carries a `(lat,lon)` pair.
const EMBEDDED_PAIR: &str =
    r"location ~ '\(\s*-?\d{1,3}(\.\d+)?\s*,\s*-?\d{1,3}(\.\d+)?\s*\)'";

/// Earthquake instant re-derived from the split columns: the calendar day of
/// `utc_date` plus the clock time of `utc_time` (midnight when absent).
const EARTHQUAKE_INSTANT: &str = "(((utc_date AT TIME ZONE 'UTC')::date \
     + COALESCE(date_trunc('second', utc_time AT TIME ZONE 'UTC')::time, TIME '00:00')) \
     AT TIME ZONE 'UTC')";

fn table(source: FeedSource) -> &'static str {
    match source {
        FeedSource::FireIncidents => "fire_incidents",
        FeedSource::Earthquakes => "earthquakes",
        FeedSource::Emergencies => "emergencies",
    }
}

fn key_column(source: FeedSource) -> &'static str {
    match source {
        FeedSource::Earthquakes => "code",
        _ => "natural_key",
    }
}

fn identity_expr() -> String {
    let fields: Vec<String> = EMERGENCY_IDENTITY_FIELDS
        .iter()
        .map(|f| format!("NULLIF(btrim(raw_payload->>'{f}'), '')"))
        .collect();
    format!("COALESCE({})", fields.join(", "))
}

/// A row from any of the three tables. Columns a table lacks fall back to
/// their defaults.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    #[sqlx(default)]
    natural_key: Option<String>,
    #[sqlx(default)]
    code: Option<String>,
    category: String,
    location: String,
    district: Option<String>,
    province: Option<String>,
    region: Option<String>,
    occurred_at: DateTime<Utc>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    raw_payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,

    #[sqlx(default)]
    status: Option<String>,
    #[sqlx(default)]
    vehicles: Option<String>,
    #[sqlx(default)]
    occurred_at_estimated: Option<bool>,

    #[sqlx(default)]
    utc_date: Option<DateTime<Utc>>,
    #[sqlx(default)]
    utc_time: Option<DateTime<Utc>>,
    #[sqlx(default)]
    magnitude: Option<f64>,
    #[sqlx(default)]
    magnitude_type: Option<String>,
    #[sqlx(default)]
    depth_km: Option<f64>,
    #[sqlx(default)]
    intensity: Option<String>,
    #[sqlx(default)]
    reference: Option<String>,
    #[sqlx(default)]
    report_pdf: Option<String>,
    #[sqlx(default)]
    accelerometric_map: Option<String>,
    #[sqlx(default)]
    intensity_map: Option<String>,
    #[sqlx(default)]
    thematic_map: Option<String>,
    #[sqlx(default)]
    shake_map: Option<String>,
    #[sqlx(default)]
    technical_report: Option<String>,

    #[sqlx(default)]
    affected: Option<i32>,
    #[sqlx(default)]
    displaced: Option<i32>,
    #[sqlx(default)]
    deceased: Option<i32>,
}

impl RecordRow {
    fn into_stored(self, source: FeedSource) -> StoredRecord {
        let details = match source {
            FeedSource::FireIncidents => RecordDetails::Fire {
                status: self.status,
                vehicles: self.vehicles,
                time_estimated: self.occurred_at_estimated.unwrap_or(false),
            },
            FeedSource::Earthquakes => RecordDetails::Earthquake {
                utc_date: self.utc_date.unwrap_or(self.occurred_at),
                utc_time: self.utc_time,
                magnitude: self.magnitude,
                magnitude_type: self.magnitude_type,
                depth_km: self.depth_km,
                intensity: self.intensity,
                reference: self.reference,
                links: EarthquakeLinks {
                    report_pdf: self.report_pdf,
                    accelerometric_map: self.accelerometric_map,
                    intensity_map: self.intensity_map,
                    thematic_map: self.thematic_map,
                    shake_map: self.shake_map,
                    technical_report: self.technical_report,
                },
            },
            FeedSource::Emergencies => RecordDetails::Emergency {
                status: self.status,
                affected: self.affected.unwrap_or(0),
                displaced: self.displaced.unwrap_or(0),
                deceased: self.deceased.unwrap_or(0),
            },
        };

        StoredRecord {
            id: self.id,
            source,
            record: FeedRecord {
                natural_key: self.natural_key.or(self.code).unwrap_or_default(),
                category: self.category,
                location_text: self.location,
                district: self.district,
                province: self.province,
                region: self.region,
                occurred_at: self.occurred_at,
                latitude: self.latitude,
                longitude: self.longitude,
                raw_payload: self.raw_payload,
            },
            details,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn into_stored(rows: Vec<RecordRow>, source: FeedSource) -> Vec<StoredRecord> {
    rows.into_iter().map(|r| r.into_stored(source)).collect()
}

/// Coordinates are replaced only as a complete pair.
fn coalesce_pair(table: &str) -> String {
    format!(
        "latitude = CASE WHEN EXCLUDED.latitude IS NOT NULL AND EXCLUDED.longitude IS NOT NULL \
             THEN EXCLUDED.latitude ELSE {table}.latitude END, \
         longitude = CASE WHEN EXCLUDED.latitude IS NOT NULL AND EXCLUDED.longitude IS NOT NULL \
             THEN EXCLUDED.longitude ELSE {table}.longitude END"
    )
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to database");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Migrations complete");
        Ok(())
    }

    // --- Writes ---

    /// Upsert a batch into `source`'s table, one statement per record.
    /// Per-record failures are logged and counted; only an unreachable
    /// datastore aborts the batch.
    pub async fn upsert(&self, source: FeedSource, records: &[NewRecord]) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();

        for record in records {
            match self.upsert_one(source, record).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.updated += 1,
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    warn!(
                        source = %source,
                        key = %record.record.natural_key,
                        error = %e,
                        "Upsert failed"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            source = %source,
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed,
            "Batch upserted"
        );
        Ok(report)
    }

    /// Upsert one record. Returns true when a new row was inserted.
    pub async fn upsert_one(&self, source: FeedSource, record: &NewRecord) -> Result<bool> {
        if record.source() != source {
            return Err(StoreError::DetailsMismatch {
                expected: source,
                found: record.source(),
            });
        }

        let r = &record.record;
        let inserted = match &record.details {
            RecordDetails::Fire {
                status,
                vehicles,
                time_estimated,
            } => {
                let sql = format!(
                    r#"
                    INSERT INTO fire_incidents
                        (natural_key, category, location, district, province, region,
                         occurred_at, latitude, longitude, status, vehicles, raw_payload,
                         occurred_at_estimated)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    ON CONFLICT (natural_key) DO UPDATE SET
                        category = EXCLUDED.category,
                        location = EXCLUDED.location,
                        district = COALESCE(EXCLUDED.district, fire_incidents.district),
                        province = COALESCE(EXCLUDED.province, fire_incidents.province),
                        region = COALESCE(EXCLUDED.region, fire_incidents.region),
                        occurred_at = CASE WHEN EXCLUDED.occurred_at_estimated
                            THEN fire_incidents.occurred_at ELSE EXCLUDED.occurred_at END,
                        occurred_at_estimated = fire_incidents.occurred_at_estimated
                            AND EXCLUDED.occurred_at_estimated,
                        {pair},
                        status = EXCLUDED.status,
                        vehicles = EXCLUDED.vehicles,
                        raw_payload = EXCLUDED.raw_payload,
                        updated_at = now()
                    RETURNING (xmax = 0) AS inserted
                    "#,
                    pair = coalesce_pair("fire_incidents"),
                );
                sqlx::query_scalar::<_, bool>(&sql)
                    .bind(&r.natural_key)
                    .bind(&r.category)
                    .bind(&r.location_text)
                    .bind(&r.district)
                    .bind(&r.province)
                    .bind(&r.region)
                    .bind(r.occurred_at)
                    .bind(r.latitude)
                    .bind(r.longitude)
                    .bind(status)
                    .bind(vehicles)
                    .bind(&r.raw_payload)
                    .bind(time_estimated)
                    .fetch_one(&self.pool)
                    .await?
            }
            RecordDetails::Earthquake {
                utc_date,
                utc_time,
                magnitude,
                magnitude_type,
                depth_km,
                intensity,
                reference,
                links,
            } => {
                let sql = format!(
                    r#"
                    INSERT INTO earthquakes
                        (code, category, location, district, province, region, occurred_at,
                         latitude, longitude, utc_date, utc_time, magnitude, magnitude_type,
                         depth_km, intensity, reference, report_pdf, accelerometric_map,
                         intensity_map, thematic_map, shake_map, technical_report, raw_payload)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                            $16, $17, $18, $19, $20, $21, $22, $23)
                    ON CONFLICT (code) DO UPDATE SET
                        category = EXCLUDED.category,
                        location = EXCLUDED.location,
                        district = COALESCE(EXCLUDED.district, earthquakes.district),
                        province = COALESCE(EXCLUDED.province, earthquakes.province),
                        region = COALESCE(EXCLUDED.region, earthquakes.region),
                        occurred_at = EXCLUDED.occurred_at,
                        utc_date = EXCLUDED.utc_date,
                        utc_time = EXCLUDED.utc_time,
                        {pair},
                        magnitude = COALESCE(EXCLUDED.magnitude, earthquakes.magnitude),
                        magnitude_type = COALESCE(EXCLUDED.magnitude_type, earthquakes.magnitude_type),
                        depth_km = COALESCE(EXCLUDED.depth_km, earthquakes.depth_km),
                        intensity = COALESCE(EXCLUDED.intensity, earthquakes.intensity),
                        reference = COALESCE(EXCLUDED.reference, earthquakes.reference),
                        report_pdf = COALESCE(EXCLUDED.report_pdf, earthquakes.report_pdf),
                        accelerometric_map = COALESCE(EXCLUDED.accelerometric_map, earthquakes.accelerometric_map),
                        intensity_map = COALESCE(EXCLUDED.intensity_map, earthquakes.intensity_map),
                        thematic_map = COALESCE(EXCLUDED.thematic_map, earthquakes.thematic_map),
                        shake_map = COALESCE(EXCLUDED.shake_map, earthquakes.shake_map),
                        technical_report = COALESCE(EXCLUDED.technical_report, earthquakes.technical_report),
                        raw_payload = EXCLUDED.raw_payload,
                        updated_at = now()
                    RETURNING (xmax = 0) AS inserted
                    "#,
                    pair = coalesce_pair("earthquakes"),
                );
                sqlx::query_scalar::<_, bool>(&sql)
                    .bind(&r.natural_key)
                    .bind(&r.category)
                    .bind(&r.location_text)
                    .bind(&r.district)
                    .bind(&r.province)
                    .bind(&r.region)
                    .bind(r.occurred_at)
                    .bind(r.latitude)
                    .bind(r.longitude)
                    .bind(utc_date)
                    .bind(utc_time)
                    .bind(magnitude)
                    .bind(magnitude_type)
                    .bind(depth_km)
                    .bind(intensity)
                    .bind(reference)
                    .bind(&links.report_pdf)
                    .bind(&links.accelerometric_map)
                    .bind(&links.intensity_map)
                    .bind(&links.thematic_map)
                    .bind(&links.shake_map)
                    .bind(&links.technical_report)
                    .bind(&r.raw_payload)
                    .fetch_one(&self.pool)
                    .await?
            }
            RecordDetails::Emergency {
                status,
                affected,
                displaced,
                deceased,
            } => {
                // Person counts never regress: a later 0 keeps the stored value.
                let sql = format!(
                    r#"
                    INSERT INTO emergencies
                        (natural_key, category, location, district, province, region,
                         occurred_at, latitude, longitude, status, affected, displaced,
                         deceased, raw_payload)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    ON CONFLICT (natural_key) DO UPDATE SET
                        category = EXCLUDED.category,
                        location = EXCLUDED.location,
                        district = COALESCE(EXCLUDED.district, emergencies.district),
                        province = COALESCE(EXCLUDED.province, emergencies.province),
                        region = COALESCE(EXCLUDED.region, emergencies.region),
                        {pair},
                        status = COALESCE(EXCLUDED.status, emergencies.status),
                        affected = COALESCE(NULLIF(EXCLUDED.affected, 0), emergencies.affected),
                        displaced = COALESCE(NULLIF(EXCLUDED.displaced, 0), emergencies.displaced),
                        deceased = COALESCE(NULLIF(EXCLUDED.deceased, 0), emergencies.deceased),
                        raw_payload = EXCLUDED.raw_payload,
                        updated_at = now()
                    RETURNING (xmax = 0) AS inserted
                    "#,
                    pair = coalesce_pair("emergencies"),
                );
                sqlx::query_scalar::<_, bool>(&sql)
                    .bind(&r.natural_key)
                    .bind(&r.category)
                    .bind(&r.location_text)
                    .bind(&r.district)
                    .bind(&r.province)
                    .bind(&r.region)
                    .bind(r.occurred_at)
                    .bind(r.latitude)
                    .bind(r.longitude)
                    .bind(status)
                    .bind(*affected)
                    .bind(*displaced)
                    .bind(*deceased)
                    .bind(&r.raw_payload)
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        Ok(inserted)
    }

    // --- Queries ---

    /// Records whose instant falls in `[now - window, now]`, newest first.
    /// Earthquakes are filtered on the instant re-derived from their split
    /// date/time columns rather than the stored `occurred_at`.
    pub async fn range_query(
        &self,
        source: FeedSource,
        now: DateTime<Utc>,
        window: QueryWindow,
    ) -> Result<Vec<StoredRecord>> {
        let (from, to) = window.bounds(now);
        let instant = match source {
            FeedSource::Earthquakes => EARTHQUAKE_INSTANT,
            _ => "occurred_at",
        };
        let sql = format!(
            "SELECT * FROM {table} \
             WHERE {instant} BETWEEN $1 AND $2 \
             ORDER BY {instant} DESC, id DESC",
            table = table(source),
        );

        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        Ok(into_stored(rows, source))
    }

    /// Case-insensitive district match, newest first.
    pub async fn by_district(&self, source: FeedSource, district: &str) -> Result<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE lower(district) = lower($1) ORDER BY occurred_at DESC, id DESC",
            table(source)
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(district.trim())
            .fetch_all(&self.pool)
            .await?;

        Ok(into_stored(rows, source))
    }

    pub async fn by_natural_key(&self, source: FeedSource, key: &str) -> Result<Option<StoredRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = $1",
            table(source),
            key_column(source)
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into_stored(source)))
    }

    /// Records with unusable coordinates, or whose location still carries an
    /// un-promoted `(lat,lon)` pair. Newest first.
    pub async fn missing_geo(&self, source: FeedSource, limit: i64) -> Result<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT * FROM {table} \
             WHERE {INVALID_COORDS} OR {EMBEDDED_PAIR} \
             ORDER BY occurred_at DESC, id DESC \
             LIMIT $1",
            table = table(source),
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(into_stored(rows, source))
    }

    /// Set a record's coordinates, and optionally its cleaned location text.
    /// Applies only while the record still needs it (invalid pair or an
    /// embedded pair in the text); returns whether the row changed.
    pub async fn set_coordinates(
        &self,
        source: FeedSource,
        id: Uuid,
        latitude: f64,
        longitude: f64,
        location: Option<&str>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {table} \
             SET latitude = $2, longitude = $3, location = COALESCE($4, location), updated_at = now() \
             WHERE id = $1 AND ({INVALID_COORDS} OR {EMBEDDED_PAIR})",
            table = table(source),
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(latitude)
            .bind(longitude)
            .bind(location)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // --- Maintenance ---

    /// Delete civil-defense rows that share a provider identity (carried in
    /// the raw payload), keeping the earliest per identity. Returns the number
    /// of rows removed.
    pub async fn recover_identity_duplicates(&self) -> Result<u64> {
        let identity = identity_expr();
        let sql = format!(
            r#"
            WITH ranked AS (
                SELECT id,
                       ROW_NUMBER() OVER (
                           PARTITION BY {identity}
                           ORDER BY created_at ASC, id ASC
                       ) AS rn
                FROM emergencies
                WHERE {identity} IS NOT NULL
            )
            DELETE FROM emergencies e
            USING ranked
            WHERE e.id = ranked.id AND ranked.rn > 1
            "#
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        let deleted = result.rows_affected();
        info!(deleted, "Emergency identity duplicates removed");
        Ok(deleted)
    }

    /// Codes of the most recent earthquakes with at least one empty link.
    pub async fn earthquakes_missing_links(&self, limit: i64) -> Result<Vec<String>> {
        let codes = sqlx::query_scalar::<_, String>(
            r#"
            SELECT code FROM earthquakes
            WHERE report_pdf IS NULL OR accelerometric_map IS NULL OR intensity_map IS NULL
               OR thematic_map IS NULL OR shake_map IS NULL OR technical_report IS NULL
            ORDER BY occurred_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(codes)
    }

    /// Fill link columns from `links`; present values win, missing ones keep
    /// what is stored. Returns whether the earthquake exists.
    pub async fn update_earthquake_links(&self, code: &str, links: &EarthquakeLinks) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE earthquakes SET
                report_pdf = COALESCE($2, report_pdf),
                accelerometric_map = COALESCE($3, accelerometric_map),
                intensity_map = COALESCE($4, intensity_map),
                thematic_map = COALESCE($5, thematic_map),
                shake_map = COALESCE($6, shake_map),
                technical_report = COALESCE($7, technical_report),
                updated_at = now()
            WHERE code = $1
            "#,
        )
        .bind(code)
        .bind(&links.report_pdf)
        .bind(&links.accelerometric_map)
        .bind(&links.intensity_map)
        .bind(&links.thematic_map)
        .bind(&links.shake_map)
        .bind(&links.technical_report)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_expression_prefers_fields_in_order() {
        assert_eq!(
            identity_expr(),
            "COALESCE(NULLIF(btrim(raw_payload->>'CODIGO'), ''), \
             NULLIF(btrim(raw_payload->>'CODIGO_SINPAD'), ''), \
             NULLIF(btrim(raw_payload->>'COD_SINPAD'), ''))"
        );
    }

    #[test]
    fn earthquakes_key_on_code() {
        assert_eq!(key_column(FeedSource::Earthquakes), "code");
        assert_eq!(key_column(FeedSource::Emergencies), "natural_key");
        assert_eq!(table(FeedSource::FireIncidents), "fire_incidents");
    }
}
