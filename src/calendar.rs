//! Conversions between Unix milliseconds and a tenant's local calendar.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use chrono_tz::Tz;

use crate::model::{Ms, Span, TimeOfDay};

/// Resolve a local wall-clock time to an instant. Times inside a DST gap
/// resolve to the first valid instant after the gap.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Ms {
    let mut candidate = local;
    for _ in 0..4 {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return dt.timestamp_millis();
        }
        candidate += Duration::minutes(30);
    }
    // No zone has a gap longer than two hours.
    local.and_utc().timestamp_millis()
}

/// Instant of `time` on `date` in `tz`. `24:00` is the following midnight.
pub fn local_instant(date: NaiveDate, time: TimeOfDay, tz: Tz) -> Ms {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    resolve_local(tz, midnight + Duration::minutes(time.minutes() as i64))
}

/// The local day `[00:00, 24:00)` of `date` as instants.
pub fn day_span(date: NaiveDate, tz: Tz) -> Span {
    Span::new(
        local_instant(date, TimeOfDay::MIDNIGHT, tz),
        local_instant(date, TimeOfDay::END_OF_DAY, tz),
    )
}

pub fn local_date(at: Ms, tz: Tz) -> Option<NaiveDate> {
    let utc = chrono::DateTime::from_timestamp_millis(at)?;
    Some(utc.with_timezone(&tz).date_naive())
}

/// Local minute-precision time of day of `at`.
pub fn local_time_of_day(at: Ms, tz: Tz) -> Option<TimeOfDay> {
    let utc = chrono::DateTime::from_timestamp_millis(at)?;
    let local = utc.with_timezone(&tz);
    TimeOfDay::from_hm(local.hour() as u16, local.minute() as u16)
}

/// 0 = Sunday … 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("bad date {s:?}: {e}"))
}

/// Accepts integer milliseconds or an RFC 3339 timestamp.
pub fn parse_instant(s: &str) -> Result<Ms, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("bad timestamp {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HOUR_MS, MINUTE_MS};

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn utc_day_span_is_24h() {
        let span = day_span(date("2025-06-10"), Tz::UTC);
        assert_eq!(span.duration_ms(), 24 * HOUR_MS);
        assert_eq!(span.start, parse_instant("2025-06-10T00:00:00Z").unwrap());
    }

    #[test]
    fn local_instant_honours_timezone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let ten = local_instant(date("2025-06-10"), TimeOfDay::from_hm(10, 0).unwrap(), tz);
        // CEST is UTC+2 in June.
        assert_eq!(ten, parse_instant("2025-06-10T08:00:00Z").unwrap());
        assert_eq!(local_time_of_day(ten, tz).unwrap().to_string(), "10:00");
        assert_eq!(local_date(ten, tz).unwrap(), date("2025-06-10"));
    }

    #[test]
    fn dst_spring_forward_day_is_23h() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let span = day_span(date("2025-03-30"), tz);
        assert_eq!(span.duration_ms(), 23 * HOUR_MS);
    }

    #[test]
    fn dst_gap_resolves_after_gap() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        // 02:30 does not exist on 2025-03-30 in Berlin.
        let t = local_instant(date("2025-03-30"), TimeOfDay::from_hm(2, 30).unwrap(), tz);
        let three = local_instant(date("2025-03-30"), TimeOfDay::from_hm(3, 0).unwrap(), tz);
        assert_eq!(t, three);
        let one_thirty = local_instant(date("2025-03-30"), TimeOfDay::from_hm(1, 30).unwrap(), tz);
        assert_eq!(three - one_thirty, 30 * MINUTE_MS);
    }

    #[test]
    fn weekday_numbering_starts_sunday() {
        assert_eq!(day_of_week(date("2025-06-08")), 0); // Sunday
        assert_eq!(day_of_week(date("2025-06-10")), 2); // Tuesday
        assert_eq!(day_of_week(date("2025-06-14")), 6); // Saturday
    }

    #[test]
    fn parse_instant_accepts_both_forms() {
        assert_eq!(parse_instant("1000").unwrap(), 1000);
        assert_eq!(parse_instant("1970-01-01T00:00:01Z").unwrap(), 1000);
        assert!(parse_instant("yesterday").is_err());
    }
}
