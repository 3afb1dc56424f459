use crate::core::{DomainError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

pub fn utcnow() -> DateTime<Utc> {
    Utc::now()
}

/// Parses an ISO-8601 timestamp. Naive inputs are taken as UTC; a bare date is
/// midnight UTC.
pub fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, DATETIME_FORMAT) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(localize(naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        return Ok(localize(date.and_time(NaiveTime::MIN)));
    }
    Err(DomainError::validation(format!(
        "'{}' is not a valid datetime",
        raw
    )))
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .or_else(|_| parse_datetime(raw).map(|ts| ts.date_naive()))
        .map_err(|_| DomainError::validation(format!("'{}' is not a valid date", raw)))
}

pub fn parse_time(raw: &str) -> Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| DomainError::validation(format!("'{}' is not a valid time", raw)))
}

pub fn localize(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

pub fn from_timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| DomainError::validation(format!("{} is out of range for a timestamp", seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_offsets_to_utc() {
        let ts = parse_datetime("2024-03-01T10:00:00+05:30").unwrap();
        assert_eq!(ts.hour(), 4);
        assert_eq!(ts.minute(), 30);
    }

    #[test]
    fn test_naive_is_utc() {
        let ts = parse_datetime("2024-03-01 10:00:00").unwrap();
        assert_eq!(ts.hour(), 10);
        let midnight = parse_datetime("2024-03-01").unwrap();
        assert_eq!(midnight.day(), 1);
        assert_eq!(midnight.hour(), 0);
    }

    #[test]
    fn test_time_formats() {
        assert_eq!(parse_time("07:15").unwrap().minute(), 15);
        assert!(parse_time("25:00:00").is_err());
    }
}
