//! RFC 3339 UTC timestamps with millisecond precision, without a calendar crate.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Current time, e.g. `2026-10-18T09:30:00.125Z`.
pub fn now_rfc3339() -> String {
    millis_to_rfc3339(now_unix_millis())
}

pub fn millis_to_rfc3339(millis: u64) -> String {
    let secs = millis / 1000;
    let ms = millis % 1000;
    let (y, m, d) = civil_from_days((secs / 86_400) as i64);
    let tod = secs % 86_400;
    format!(
        "{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}.{ms:03}Z",
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    )
}

/// Days since 1970-01-01 → (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Split a `YYYY-MM-DD` day into (year, month, day). Rejects dates that do
/// not exist in the proleptic Gregorian calendar.
pub fn parse_day(day: &str) -> Option<(i64, u32, u32)> {
    let b = day.as_bytes();
    if b.len() != 10 || b[4] != b'-' || b[7] != b'-' {
        return None;
    }
    let digits = |r: std::ops::Range<usize>| -> Option<u32> {
        let part = &day[r];
        if !part.bytes().all(|c| c.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    };
    let y = i64::from(digits(0..4)?);
    let m = digits(5..7)?;
    let d = digits(8..10)?;
    if !(1..=12).contains(&m) || d < 1 || d > days_in_month(y, m) {
        return None;
    }
    Some((y, m, d))
}

fn days_in_month(year: i64, month: u32) -> u32 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        _ => 31,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch() {
        assert_eq!(millis_to_rfc3339(0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_known_instant_with_millis() {
        // 2026-02-21T00:00:00Z = 1771632000 s
        assert_eq!(millis_to_rfc3339(1_771_632_000_042), "2026-02-21T00:00:00.042Z");
    }

    #[test]
    fn test_leap_day() {
        // 2024-02-29T12:34:56Z = 1709210096 s
        assert_eq!(millis_to_rfc3339(1_709_210_096_999), "2024-02-29T12:34:56.999Z");
    }

    #[test]
    fn test_now_shape() {
        let ts = now_rfc3339();
        assert_eq!(ts.len(), 24, "{ts}");
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn test_parse_day() {
        assert_eq!(parse_day("2026-10-18"), Some((2026, 10, 18)));
        assert_eq!(parse_day("2026-13-01"), None);
        assert_eq!(parse_day("yesterday"), None);
    }

    #[test]
    fn test_parse_day_rejects_impossible_dates() {
        assert_eq!(parse_day("2026-02-31"), None);
        assert_eq!(parse_day("2026-04-31"), None);
        assert_eq!(parse_day("2026-02-29"), None);
        assert_eq!(parse_day("2024-02-29"), Some((2024, 2, 29)));
        assert_eq!(parse_day("2000-02-29"), Some((2000, 2, 29)));
        assert_eq!(parse_day("1900-02-29"), None);
        assert_eq!(parse_day("2026-00-10"), None);
    }

    #[test]
    fn test_parse_day_requires_fixed_layout() {
        assert_eq!(parse_day("2026-1-011"), None);
        assert_eq!(parse_day("202-10-018"), None);
        assert_eq!(parse_day("2026-+1-01"), None);
        assert_eq!(parse_day("2026/10/18"), None);
        assert_eq!(parse_day("2026-10-1é"), None);
    }
}
