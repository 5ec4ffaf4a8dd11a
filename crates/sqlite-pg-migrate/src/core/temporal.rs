//! Parsing of the date and time encodings SQLite applications store.
//!
//! SQLite has no temporal storage class. Applications keep ISO-8601 text,
//! unix epoch integers or julian day reals; these helpers read all three.
//! Parsed instants are rounded to microseconds, PostgreSQL's resolution.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// Fractional second digits PostgreSQL keeps.
const MICRO_DIGITS: u16 = 6;

/// Julian day number of the unix epoch.
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;

/// Parse text into a UTC instant.
///
/// Values carrying an offset are converted; naive values are taken as UTC.
pub fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).round_subsecs(MICRO_DIGITS));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(dt.with_timezone(&Utc).round_subsecs(MICRO_DIGITS));
        }
    }
    let naive = text.strip_suffix('Z').unwrap_or(text);
    parse_naive(naive).map(|n| n.and_utc())
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.round_subsecs(MICRO_DIGITS));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parse text into a timestamp without time zone.
///
/// Values with an offset are shifted to UTC before the zone is dropped.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let trimmed = text.trim();
    parse_naive(trimmed).or_else(|| parse_instant(trimmed).map(|dt| dt.naive_utc()))
}

/// Parse text into a date, accepting full timestamps too.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(trimmed).map(|dt| dt.date()))
}

/// Parse text into a time of day.
pub fn parse_time(text: &str) -> Option<NaiveTime> {
    let trimmed = text.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(trimmed, fmt).ok())
}

/// Interpret an integer as unix epoch seconds.
pub fn from_unix_seconds(secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

/// Interpret a real as a julian day number, as produced by `julianday()`.
pub fn from_julian_day(day: f64) -> Option<NaiveDateTime> {
    if !day.is_finite() {
        return None;
    }
    let micros = ((day - UNIX_EPOCH_JULIAN_DAY) * 86_400_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

/// Canonical text form of a timestamp, microsecond precision.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.round_subsecs(MICRO_DIGITS).format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Canonical text form of a date.
pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
