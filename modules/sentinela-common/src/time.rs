// Instant reconstruction for feeds that publish split, epoch-anchored, or
// zone-less timestamps. Every function here returns a UTC instant.

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};

/// The feeds' home timezone (UTC-5, no daylight saving).
pub const SOURCE_UTC_OFFSET_SECS: i32 = -5 * 3600;

pub fn source_offset() -> FixedOffset {
    FixedOffset::east_opt(SOURCE_UTC_OFFSET_SECS).expect("UTC-5 is a valid offset")
}

/// Combine the calendar day of `date` with the clock time of `time`, both
/// read as UTC components. The date component of `time` is a placeholder and
/// is discarded; sub-second precision is dropped. A missing time means
/// midnight of `date`'s day.
pub fn combine_date_time(date: DateTime<Utc>, time: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let clock = time
        .and_then(|t| NaiveTime::from_hms_opt(t.hour(), t.minute(), t.second()))
        .unwrap_or(NaiveTime::MIN);
    date.date_naive().and_time(clock).and_utc()
}

/// Parse the loose instant strings REST feeds emit: RFC 3339, a naive
/// `YYYY-MM-DD HH:MM:SS` read as UTC, a bare date (midnight UTC), or a bare
/// time (anchored to the 1970-01-01 placeholder).
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::MIN).and_utc());
    }
    for fmt in ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(s, fmt) {
            return Some(epoch_placeholder().and_time(time).and_utc());
        }
    }
    None
}

fn epoch_placeholder() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

/// Rewrite the Spanish-locale meridiem markers ("p. m.", "a.m.") into the
/// `AM`/`PM` tokens chrono understands and collapse whitespace.
fn normalize_meridiem(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let compact: String = upper
        .replace("A. M.", "AM")
        .replace("P. M.", "PM")
        .replace("A.M.", "AM")
        .replace("P.M.", "PM")
        .replace("A.M", "AM")
        .replace("P.M", "PM");
    compact.split_whitespace().collect::<Vec<_>>().join(" ")
}

const LOCAL_12H_FORMATS: [&str; 6] = [
    "%d/%m/%Y %I:%M:%S %p",
    "%d/%m/%Y %I:%M %p",
    "%d-%m-%Y %I:%M:%S %p",
    "%d-%m-%Y %I:%M %p",
    "%Y-%m-%d %I:%M:%S %p",
    "%Y-%m-%d %I:%M %p",
];

/// Parse a zone-less 12-hour local timestamp (e.g. `18/10/2026 03:45:12 p.m.`)
/// as source-local time and convert it to UTC.
pub fn parse_source_local_12h(raw: &str) -> Option<DateTime<Utc>> {
    let normalized = normalize_meridiem(raw);
    if !(normalized.ends_with("AM") || normalized.ends_with("PM")) {
        return None;
    }
    let naive = LOCAL_12H_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())?;
    source_offset()
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Calendar date in the source timezone at `now`.
pub fn source_today(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&source_offset()).date_naive()
}

/// Splice the current source-local time-of-day onto a date-only value.
/// The result's local date is `date`; its clock reflects when ingestion ran,
/// not when the event happened.
pub fn stitch_current_time(date: NaiveDate, now: DateTime<Utc>) -> DateTime<Utc> {
    let offset = source_offset();
    let clock = now.with_timezone(&offset).time();
    offset
        .from_local_datetime(&date.and_time(clock))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn combine_takes_day_from_date_and_clock_from_time() {
        let combined = combine_date_time(
            utc("2026-01-01T00:00:00Z"),
            Some(utc("1970-01-01T10:20:25Z")),
        );
        assert_eq!(combined, utc("2026-01-01T10:20:25Z"));
    }

    #[test]
    fn combine_ignores_time_of_day_carried_by_date() {
        let t = Some(utc("1970-01-01T10:20:25Z"));
        let morning = combine_date_time(utc("2026-01-01T00:00:00Z"), t);
        let evening = combine_date_time(utc("2026-01-01T23:59:59.999Z"), t);
        assert_eq!(morning, evening);
    }

    #[test]
    fn combine_discards_placeholder_date_of_time() {
        let d = utc("2025-07-14T00:00:00Z");
        let a = combine_date_time(d, Some(utc("1970-01-01T08:00:00Z")));
        let b = combine_date_time(d, Some(utc("1999-12-31T08:00:00Z")));
        assert_eq!(a, b);
        assert_eq!(a, utc("2025-07-14T08:00:00Z"));
    }

    #[test]
    fn combine_without_time_is_midnight() {
        let combined = combine_date_time(utc("2026-05-02T17:30:00Z"), None);
        assert_eq!(combined, utc("2026-05-02T00:00:00Z"));
    }

    #[test]
    fn combine_drops_subseconds() {
        let combined = combine_date_time(
            utc("2026-01-01T00:00:00Z"),
            Some(utc("1970-01-01T10:20:25.750Z")),
        );
        assert_eq!(combined, utc("2026-01-01T10:20:25Z"));
    }

    #[test]
    fn parse_instant_accepts_feed_shapes() {
        assert_eq!(
            parse_instant("2024-03-01T00:00:00.000Z"),
            Some(utc("2024-03-01T00:00:00Z"))
        );
        assert_eq!(parse_instant("2024-03-01"), Some(utc("2024-03-01T00:00:00Z")));
        assert_eq!(parse_instant("10:20:25"), Some(utc("1970-01-01T10:20:25Z")));
        assert_eq!(
            parse_instant("2024-03-01 05:06:07"),
            Some(utc("2024-03-01T05:06:07Z"))
        );
        assert_eq!(parse_instant("ayer"), None);
        assert_eq!(parse_instant(""), None);
    }

    #[test]
    fn local_pm_is_shifted_to_utc() {
        assert_eq!(
            parse_source_local_12h("18/10/2026 03:45:12 PM"),
            Some(utc("2026-10-18T20:45:12Z"))
        );
    }

    #[test]
    fn local_spanish_meridiem_is_understood() {
        assert_eq!(
            parse_source_local_12h("18/10/2026 11:05:00 p. m."),
            Some(utc("2026-10-19T04:05:00Z"))
        );
        assert_eq!(
            parse_source_local_12h("01/01/2026 12:10:00 a.m."),
            Some(utc("2026-01-01T05:10:00Z"))
        );
    }

    #[test]
    fn local_without_meridiem_is_rejected() {
        assert_eq!(parse_source_local_12h("18/10/2026 15:45:12"), None);
        assert_eq!(parse_source_local_12h("not a date PM"), None);
    }

    #[test]
    fn stitching_keeps_source_date_and_current_clock() {
        let date = NaiveDate::from_ymd_opt(2026, 4, 3).unwrap();
        // 14:30 UTC is 09:30 in the source timezone.
        let now = utc("2026-04-04T14:30:00Z");
        let stitched = stitch_current_time(date, now);
        assert_eq!(stitched, utc("2026-04-03T14:30:00Z"));
        assert_eq!(stitched.with_timezone(&source_offset()).date_naive(), date);
    }

    #[test]
    fn source_today_uses_offset() {
        // 02:00 UTC is still the previous evening locally.
        assert_eq!(
            source_today(utc("2026-04-04T02:00:00Z")),
            NaiveDate::from_ymd_opt(2026, 4, 3).unwrap()
        );
    }
}
