//! Lenient `Date` header parsing.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Formats seen in the wild that strict RFC 2822 parsing rejects.
const FALLBACK_FORMATS: &[&str] = &[
    "%d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M %z",
    "%a %b %d %H:%M:%S %Y %z",
    "%Y-%m-%dT%H:%M:%S%z",
];

/// Parses a `Date` header value into UTC.
///
/// Accepts strict RFC 2822, trailing `(zone comments)`, a missing weekday,
/// and a handful of common non-conforming layouts. Values without any zone
/// information are taken as UTC. Returns `None` when nothing matches.
#[must_use]
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    // "Tue, 1 Jul 2003 10:52:37 +0200 (CEST)"
    let without_comment = trimmed
        .split_once('(')
        .map_or(trimmed, |(head, _)| head)
        .trim();

    if let Ok(parsed) = DateTime::parse_from_rfc2822(without_comment) {
        return Some(parsed.with_timezone(&Utc));
    }

    // Drop a weekday that may be misspelled or inconsistent with the date.
    let without_weekday = without_comment
        .split_once(',')
        .map_or(without_comment, |(_, rest)| rest)
        .trim();

    for format in FALLBACK_FORMATS {
        for candidate in [without_comment, without_weekday] {
            if let Ok(parsed) = DateTime::parse_from_str(candidate, format) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
    }

    NaiveDateTime::parse_from_str(without_weekday, "%d %b %Y %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rfc2822() {
        let parsed = parse_date("Tue, 1 Jul 2003 10:52:37 +0200").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2003, 7, 1, 8, 52, 37).unwrap());
    }

    #[test]
    fn test_trailing_zone_comment() {
        let parsed = parse_date("Tue, 1 Jul 2003 10:52:37 +0200 (CEST)").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2003, 7, 1, 8, 52, 37).unwrap());
    }

    #[test]
    fn test_wrong_weekday_still_parses() {
        let parsed = parse_date("Mon, 1 Jul 2003 10:52:37 +0000").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2003, 7, 1, 10, 52, 37).unwrap());
    }

    #[test]
    fn test_missing_zone_is_utc() {
        let parsed = parse_date("1 Jul 2003 10:52:37").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2003, 7, 1, 10, 52, 37).unwrap());
    }

    #[test]
    fn test_garbage() {
        assert!(parse_date("").is_none());
        assert!(parse_date("yesterday-ish").is_none());
    }
}
