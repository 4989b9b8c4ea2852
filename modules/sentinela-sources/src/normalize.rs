// Normalizer: raw source records -> canonical NewRecord.
//
// Validation problems never fail a batch. An unparsable timestamp falls back
// to ingestion time and an unusable coordinate becomes null; both are counted
// in NormalizeReport. Only a record with no usable natural key is dropped.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use sentinela_common::geo::{derive_district, split_embedded_coordinates, valid_pair};
use sentinela_common::time::{
    combine_date_time, parse_instant, parse_source_local_12h, stitch_current_time,
};
use sentinela_common::{FeedRecord, NewRecord, RecordDetails};

use crate::client::RawRecord;
use crate::services::civil_defense::EmergencyFeature;
use crate::services::fire::FireRow;
use crate::services::seismic::SeismicEvent;

const EARTHQUAKE_CATEGORY: &str = "sismo";
const EMERGENCY_CATEGORY: &str = "emergencia";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub normalized: usize,
    /// Records whose timestamp fell back to ingestion time.
    pub timestamp_fallbacks: usize,
    /// Records whose source coordinates were present but invalid.
    pub coordinate_rejections: usize,
    /// Records dropped for lack of a natural key.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<NewRecord>,
    pub report: NormalizeReport,
}

#[derive(Default)]
struct Flags {
    timestamp_fallback: bool,
    coordinate_rejected: bool,
}

/// Normalize a fetched batch. `now` is the ingestion instant used for
/// fallbacks and for civil-defense time stitching.
pub fn normalize_batch(raw: Vec<RawRecord>, now: DateTime<Utc>) -> Normalized {
    let mut out = Normalized::default();

    for item in raw {
        let mut flags = Flags::default();
        let record = match item {
            RawRecord::Fire(row) => Some(normalize_fire(row, now, &mut flags)),
            RawRecord::Earthquake(event) => normalize_earthquake(event, now, &mut flags),
            RawRecord::Emergency(feature) => normalize_emergency(feature, now, &mut flags),
        };

        match record {
            Some(record) => {
                if flags.timestamp_fallback {
                    out.report.timestamp_fallbacks += 1;
                }
                if flags.coordinate_rejected {
                    out.report.coordinate_rejections += 1;
                }
                out.report.normalized += 1;
                out.records.push(record);
            }
            None => out.report.skipped += 1,
        }
    }

    out
}

fn normalize_fire(row: FireRow, now: DateTime<Utc>, flags: &mut Flags) -> NewRecord {
    let split = split_embedded_coordinates(&row.location);
    let coordinates = match split.coordinates {
        Some(c) if c.is_valid() => Some(c),
        Some(c) => {
            warn!(key = %row.number, lat = c.latitude, lon = c.longitude, "Rejected embedded coordinate");
            flags.coordinate_rejected = true;
            None
        }
        None => None,
    };

    let parsed = parse_source_local_12h(&row.reported_at);
    if parsed.is_none() {
        warn!(key = %row.number, raw = %row.reported_at, "Unparsable fire timestamp, using ingestion time");
        flags.timestamp_fallback = true;
    }
    let occurred_at = parsed.unwrap_or(now);

    let raw_payload = serde_json::to_value(&row).unwrap_or_default();
    let district = derive_district(&split.text);

    NewRecord {
        record: FeedRecord {
            natural_key: row.number,
            category: row.category,
            location_text: split.text,
            district,
            province: None,
            region: None,
            occurred_at,
            latitude: coordinates.map(|c| c.latitude),
            longitude: coordinates.map(|c| c.longitude),
            raw_payload,
        },
        details: RecordDetails::Fire {
            status: row.status,
            vehicles: row.vehicles,
            time_estimated: parsed.is_none(),
        },
    }
}

fn normalize_earthquake(event: SeismicEvent, now: DateTime<Utc>, flags: &mut Flags) -> Option<NewRecord> {
    let Some(code) = event.code.clone() else {
        warn!("Dropping seismic event without a code");
        return None;
    };

    let utc_time = event.utc_time.as_deref().and_then(parse_instant);
    let (utc_date, occurred_at) = match event.utc_date.as_deref().and_then(parse_instant) {
        Some(date) => (date, combine_date_time(date, utc_time)),
        None => {
            warn!(code = %code, raw = ?event.utc_date, "Unparsable seismic date, using ingestion time");
            flags.timestamp_fallback = true;
            (now, now)
        }
    };

    let coordinates = valid_pair(event.latitude, event.longitude);
    if coordinates.is_none() && (event.latitude.is_some() || event.longitude.is_some()) {
        flags.coordinate_rejected = true;
    }

    let reference = event.reference.clone();
    let region = reference
        .as_deref()
        .filter(|r| r.contains(','))
        .and_then(|r| r.rsplit(',').next())
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    let links = event.links();

    Some(NewRecord {
        record: FeedRecord {
            natural_key: code,
            category: EARTHQUAKE_CATEGORY.to_string(),
            location_text: reference.clone().unwrap_or_default(),
            district: None,
            province: None,
            region,
            occurred_at,
            latitude: coordinates.map(|c| c.latitude),
            longitude: coordinates.map(|c| c.longitude),
            raw_payload: event.raw,
        },
        details: RecordDetails::Earthquake {
            utc_date,
            utc_time,
            magnitude: event.magnitude,
            magnitude_type: event.magnitude_type,
            depth_km: event.depth_km,
            intensity: event.intensity,
            reference,
            links,
        },
    })
}

/// Calendar date of a civil-defense `FECHA` value: epoch milliseconds (read
/// as a UTC date) or a date string.
fn emergency_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.date_naive()),
        Value::String(s) => parse_instant(s)
            .map(|dt| dt.date_naive())
            .or_else(|| NaiveDate::parse_from_str(s.trim(), "%d/%m/%Y").ok()),
        _ => None,
    }
}

fn count(feature: &EmergencyFeature, keys: &[&str]) -> i32 {
    feature
        .number(keys)
        .map(|n| n.clamp(0.0, f64::from(i32::MAX)) as i32)
        .unwrap_or(0)
}

fn normalize_emergency(
    feature: EmergencyFeature,
    now: DateTime<Utc>,
    flags: &mut Flags,
) -> Option<NewRecord> {
    let district = feature.text(&["DISTRITO"]);
    let province = feature.text(&["PROVINCIA"]);
    let region = feature.text(&["DEPARTAMENTO", "REGION"]);
    let category = feature
        .text(&["FENOMENO", "TIPO_FENOMENO", "TIPO", "EMERGENCIA"])
        .unwrap_or_else(|| EMERGENCY_CATEGORY.to_string());

    let date = ["FECHA", "FECHA_EMERGENCIA"]
        .iter()
        .find_map(|k| feature.attr(k).and_then(emergency_date));
    let occurred_at = match date {
        Some(date) => stitch_current_time(date, now),
        None => {
            flags.timestamp_fallback = true;
            now
        }
    };

    let natural_key = feature
        .text(&["OBJECTID", "FID"])
        .or_else(|| feature.identity())
        .or_else(|| {
            let parts: Vec<String> = [date.map(|d| d.to_string()), district.clone(), Some(category.clone())]
                .into_iter()
                .flatten()
                .collect();
            (parts.len() == 3).then(|| parts.join("|"))
        });
    let Some(natural_key) = natural_key else {
        warn!("Dropping emergency without an identifier");
        return None;
    };
    if flags.timestamp_fallback {
        warn!(key = %natural_key, "Emergency without a usable date, using ingestion time");
    }

    let location_text = feature
        .text(&["DESCRIPCION", "UBICACION", "LUGAR"])
        .unwrap_or_else(|| {
            [district.as_deref(), province.as_deref(), region.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(", ")
        });
    let district = district.or_else(|| derive_district(&location_text));

    let lat = feature.latitude.or_else(|| feature.number(&["LATITUD"]));
    let lon = feature.longitude.or_else(|| feature.number(&["LONGITUD"]));
    let coordinates = valid_pair(lat, lon);
    if coordinates.is_none() && (lat.is_some() || lon.is_some()) {
        flags.coordinate_rejected = true;
    }

    let details = RecordDetails::Emergency {
        status: feature.text(&["ESTADO", "SITUACION"]),
        affected: count(&feature, &["AFECTADOS", "PERSONAS_AFECTADAS"]),
        displaced: count(&feature, &["DAMNIFICADOS", "PERSONAS_DAMNIFICADAS"]),
        deceased: count(&feature, &["FALLECIDOS"]),
    };

    Some(NewRecord {
        record: FeedRecord {
            natural_key,
            category,
            location_text,
            district,
            province,
            region,
            occurred_at,
            latitude: coordinates.map(|c| c.latitude),
            longitude: coordinates.map(|c| c.longitude),
            raw_payload: Value::Object(feature.attributes),
        },
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fire::parse_incident_table;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 22, 30, 15).unwrap()
    }

    fn emergency(attributes: Value, lon: Option<f64>, lat: Option<f64>) -> RawRecord {
        RawRecord::Emergency(EmergencyFeature {
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            longitude: lon,
            latitude: lat,
        })
    }

    #[test]
    fn three_row_table_normalizes_with_fallback() {
        let html = "<table>\
            <tr><th>Nro Parte</th><th>Fecha y Hora</th><th>Dirección / Distrito</th><th>Tipo</th></tr>\
            <tr><td>101</td><td>18/10/2026 03:45:12 p. m.</td>\
                <td>AV. UNIVERSITARIA 1200 (-12.08,-77.05) - LOS OLIVOS</td><td>INCENDIO</td></tr>\
            <tr><td>102</td><td>17/10/2026 11:05:00 a. m.</td>\
                <td>JR. AREQUIPA 300 - LIMA</td><td>RESCATE</td></tr>\
            <tr><td>103</td><td>fecha no disponible</td>\
                <td>CALLE LAS FLORES 9 - SURCO</td><td>FUGA DE GAS</td></tr>\
            </table>";

        let raw = parse_incident_table(html).into_iter().map(RawRecord::Fire).collect();
        let out = normalize_batch(raw, now());

        assert_eq!(out.records.len(), 3);
        assert_eq!(
            out.report,
            NormalizeReport {
                normalized: 3,
                timestamp_fallbacks: 1,
                coordinate_rejections: 0,
                skipped: 0,
            }
        );

        let first = &out.records[0].record;
        assert_eq!(first.natural_key, "101");
        assert_eq!(first.location_text, "AV. UNIVERSITARIA 1200 - LOS OLIVOS");
        assert_eq!(first.district.as_deref(), Some("LOS OLIVOS"));
        assert_eq!((first.latitude, first.longitude), (Some(-12.08), Some(-77.05)));
        assert_eq!(first.occurred_at, Utc.with_ymd_and_hms(2026, 10, 18, 20, 45, 12).unwrap());

        let second = &out.records[1].record;
        assert_eq!(second.occurred_at, Utc.with_ymd_and_hms(2026, 10, 17, 16, 5, 0).unwrap());
        assert_eq!(second.latitude, None);
        assert_eq!(second.district.as_deref(), Some("LIMA"));

        let third = &out.records[2].record;
        assert_eq!(third.natural_key, "103");
        assert_eq!(third.occurred_at, now());
        assert_eq!(third.category, "FUGA DE GAS");

        let estimated: Vec<bool> = out
            .records
            .iter()
            .map(|r| matches!(r.details, RecordDetails::Fire { time_estimated: true, .. }))
            .collect();
        assert_eq!(estimated, vec![false, false, true]);
    }

    #[test]
    fn out_of_range_embedded_coordinate_is_rejected() {
        let row = FireRow {
            number: "7".to_string(),
            reported_at: "18/10/2026 01:00 PM".to_string(),
            location: "KM 40 (0,0) - ANCON".to_string(),
            category: "INCENDIO".to_string(),
            status: None,
            vehicles: None,
        };
        let out = normalize_batch(vec![RawRecord::Fire(row)], now());
        let record = &out.records[0].record;
        assert_eq!(record.latitude, None);
        assert_eq!(record.location_text, "KM 40 - ANCON");
        assert_eq!(out.report.coordinate_rejections, 1);
    }

    #[test]
    fn earthquake_takes_day_from_date_and_clock_from_time() {
        let event: SeismicEvent = serde_json::from_value(json!({
            "codigo": "2026-0451",
            "fecha_utc": "2026-10-17T00:00:00.000Z",
            "hora_utc": "1970-01-01T10:20:25.000Z",
            "latitud": -12.35,
            "longitud": -77.12,
            "magnitud": 4.2,
            "referencia": "28 km al SO de Lima, Lima"
        }))
        .unwrap();

        let out = normalize_batch(vec![RawRecord::Earthquake(event)], now());
        let rec = &out.records[0];
        assert_eq!(rec.record.occurred_at, Utc.with_ymd_and_hms(2026, 10, 17, 10, 20, 25).unwrap());
        assert_eq!(rec.record.category, EARTHQUAKE_CATEGORY);
        assert_eq!(rec.record.region.as_deref(), Some("Lima"));
        assert_eq!(rec.record.location_text, "28 km al SO de Lima, Lima");
        match &rec.details {
            RecordDetails::Earthquake { utc_time, magnitude, .. } => {
                assert_eq!(*utc_time, Some(Utc.with_ymd_and_hms(1970, 1, 1, 10, 20, 25).unwrap()));
                assert_eq!(*magnitude, Some(4.2));
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[test]
    fn earthquake_without_time_uses_midnight_and_without_code_is_skipped() {
        let no_time = SeismicEvent {
            code: Some("A".to_string()),
            utc_date: Some("2026-10-17".to_string()),
            ..Default::default()
        };
        let no_code = SeismicEvent {
            utc_date: Some("2026-10-17".to_string()),
            ..Default::default()
        };
        let bad_date = SeismicEvent {
            code: Some("B".to_string()),
            utc_date: Some("yesterday".to_string()),
            ..Default::default()
        };

        let out = normalize_batch(
            vec![
                RawRecord::Earthquake(no_time),
                RawRecord::Earthquake(no_code),
                RawRecord::Earthquake(bad_date),
            ],
            now(),
        );
        assert_eq!(out.report.skipped, 1);
        assert_eq!(out.report.timestamp_fallbacks, 1);
        assert_eq!(out.records[0].record.occurred_at, Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap());
        assert_eq!(out.records[1].record.occurred_at, now());
    }

    #[test]
    fn emergency_date_gets_current_source_clock() {
        // FECHA is 2026-10-17 00:00 UTC; ingestion runs at 17:30:15 local.
        let raw = emergency(
            json!({
                "OBJECTID": 4471,
                "CODIGO": "SINPAD-88",
                "FECHA": 1_792_195_200_000i64,
                "FENOMENO": "LLUVIA INTENSA",
                "DISTRITO": "CHOSICA",
                "PROVINCIA": "LIMA",
                "DEPARTAMENTO": "LIMA",
                "AFECTADOS": 12,
                "DAMNIFICADOS": "-3",
                "ESTADO": "EN ATENCION"
            }),
            Some(-76.69),
            Some(-11.93),
        );

        let out = normalize_batch(vec![raw], now());
        let rec = &out.records[0];
        assert_eq!(rec.record.natural_key, "4471");
        assert_eq!(rec.record.category, "LLUVIA INTENSA");
        assert_eq!(rec.record.location_text, "CHOSICA, LIMA, LIMA");
        assert_eq!(rec.record.occurred_at, Utc.with_ymd_and_hms(2026, 10, 17, 22, 30, 15).unwrap());
        assert_eq!(rec.record.raw_payload["CODIGO"], "SINPAD-88");
        assert_eq!(
            rec.details,
            RecordDetails::Emergency {
                status: Some("EN ATENCION".to_string()),
                affected: 12,
                displaced: 0,
                deceased: 0,
            }
        );
    }

    #[test]
    fn emergency_key_falls_back_to_identity_then_composite() {
        let by_identity = emergency(json!({ "CODIGO": "SINPAD-1", "FECHA": "2026-10-17" }), None, None);
        let composite = emergency(
            json!({ "FECHA": "17/10/2026", "DISTRITO": "ILO", "FENOMENO": "HUAICO" }),
            Some(0.0),
            Some(0.0),
        );
        let anonymous = emergency(json!({ "DISTRITO": "ILO" }), None, None);

        let out = normalize_batch(vec![by_identity, composite, anonymous], now());
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.report.skipped, 1);
        assert_eq!(out.records[0].record.natural_key, "SINPAD-1");
        assert_eq!(out.records[1].record.natural_key, "2026-10-17|ILO|HUAICO");
        assert_eq!(out.records[1].record.latitude, None);
        assert_eq!(out.report.coordinate_rejections, 1);
    }
}
