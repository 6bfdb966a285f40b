//! Timestamp parsing and time-bucket quantization.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Digit-only timestamps with at least this many digits are epoch millis.
const EPOCH_MILLIS_MIN_DIGITS: usize = 12;

/// Parse a hook timestamp. Accepts RFC 3339, zone-less ISO-8601 (interpreted
/// in `local`), and epoch seconds or milliseconds.
pub fn parse_timestamp(raw: &str, local: &FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        let n: i64 = raw.parse().ok()?;
        return if raw.len() >= EPOCH_MILLIS_MIN_DIGITS {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
    }

    NAIVE_FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
        local
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// `floor(epoch_seconds / bucket_size) * bucket_size`, as a UTC instant.
pub fn bucket_key(ts: DateTime<Utc>, bucket_size_seconds: i64) -> DateTime<Utc> {
    let size = bucket_size_seconds.max(1);
    let key = ts.timestamp().div_euclid(size) * size;
    Utc.timestamp_opt(key, 0).single().unwrap_or(ts)
}
