use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::{format_description, time},
    Date, Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset,
};

const NAIVE_WITH_FRACTION: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
const NAIVE_SECONDS: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const CALENDAR_DATE: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Earliest and latest years the ledger can order lexically.
pub const MIN_STORABLE_YEAR: i32 = 1970;
pub const MAX_STORABLE_YEAR: i32 = 9999;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("invalid timestamp '{0}': expected ISO-8601 date-time")]
    DateTime(String),
    #[error("invalid date '{0}': expected YYYY-MM-DD")]
    Date(String),
}

/// Parse a reading timestamp.
///
/// Accepts RFC 3339 with an explicit offset, or a naive
/// `YYYY-MM-DDTHH:MM:SS[.fraction]` which is taken to be UTC.
pub fn parse_timestamp(s: &str) -> Result<OffsetDateTime, TimestampError> {
    let trimmed = s.trim();

    if let Ok(ts) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(ts.to_offset(UtcOffset::UTC));
    }

    for fmt in [NAIVE_WITH_FRACTION, NAIVE_SECONDS] {
        if let Ok(ts) = PrimitiveDateTime::parse(trimmed, fmt) {
            return Ok(ts.assume_utc());
        }
    }

    Err(TimestampError::DateTime(trimmed.to_string()))
}

pub fn parse_date(s: &str) -> Result<Date, TimestampError> {
    Date::parse(s.trim(), CALENDAR_DATE).map_err(|_| TimestampError::Date(s.trim().to_string()))
}

/// Convert to UTC and drop sub-microsecond precision, matching what the
/// ledger persists.
pub fn normalize(ts: OffsetDateTime) -> OffsetDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    utc - Duration::nanoseconds(i64::from(utc.nanosecond() % 1_000))
}

pub fn now_utc() -> OffsetDateTime {
    normalize(OffsetDateTime::now_utc())
}

pub fn is_storable(ts: OffsetDateTime) -> bool {
    let year = ts.to_offset(UtcOffset::UTC).year();
    (MIN_STORABLE_YEAR..=MAX_STORABLE_YEAR).contains(&year)
}

/// Fixed-width UTC form (`YYYY-MM-DDTHH:MM:SS.ffffffZ`) used as the stored
/// column value, so string comparison orders chronologically.
pub fn to_storage_string(ts: OffsetDateTime) -> String {
    let ts = normalize(ts);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        ts.year(),
        u8::from(ts.month()),
        ts.day(),
        ts.hour(),
        ts.minute(),
        ts.second(),
        ts.microsecond()
    )
}

/// Floor a timestamp to the enclosing half-hour (minute 0 or 30) in UTC.
pub fn half_hour_floor(ts: OffsetDateTime) -> OffsetDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    utc - Duration::minutes(i64::from(utc.minute() % 30))
        - Duration::seconds(i64::from(utc.second()))
        - Duration::nanoseconds(i64::from(utc.nanosecond()))
}

/// Closed interval covering a whole UTC calendar day at storage precision.
pub fn day_bounds(date: Date) -> (OffsetDateTime, OffsetDateTime) {
    let start = date.midnight().assume_utc();
    let end = PrimitiveDateTime::new(date, time!(23:59:59.999_999)).assume_utc();
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn parses_naive_timestamp_as_utc() {
        let ts = parse_timestamp("2024-01-01T10:15:00").unwrap();
        assert_eq!(ts, datetime!(2024-01-01 10:15:00 UTC));

        let ts = parse_timestamp("2024-01-01T10:15:00.250000").unwrap();
        assert_eq!(ts, datetime!(2024-01-01 10:15:00.25 UTC));
    }

    #[test]
    fn parses_offset_timestamp_into_utc() {
        let ts = parse_timestamp("2024-01-01T12:15:00+02:00").unwrap();
        assert_eq!(ts, datetime!(2024-01-01 10:15:00 UTC));
        assert_eq!(ts.offset(), UtcOffset::UTC);
    }

    #[test]
    fn rejects_garbage_timestamp() {
        assert!(matches!(parse_timestamp("yesterday"), Err(TimestampError::DateTime(_))));
        assert!(matches!(parse_date("2024-13-01"), Err(TimestampError::Date(_))));
    }

    #[test]
    fn storage_string_is_fixed_width_and_ordered() {
        let a = to_storage_string(datetime!(2024-01-01 09:59:59.999999 UTC));
        let b = to_storage_string(datetime!(2024-01-01 10:00:00 UTC));
        assert_eq!(b, "2024-01-01T10:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn half_hour_floor_zeroes_minutes_and_seconds() {
        assert_eq!(
            half_hour_floor(datetime!(2024-01-01 10:25:41.5 UTC)),
            datetime!(2024-01-01 10:00:00 UTC)
        );
        assert_eq!(
            half_hour_floor(datetime!(2024-01-01 10:35:00 UTC)),
            datetime!(2024-01-01 10:30:00 UTC)
        );
        assert_eq!(
            half_hour_floor(datetime!(2024-01-01 10:30:00 UTC)),
            datetime!(2024-01-01 10:30:00 UTC)
        );
    }

    #[test]
    fn day_bounds_cover_last_second_of_day() {
        let (start, end) = day_bounds(date!(2024-01-01));
        assert_eq!(start, datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(end, datetime!(2024-01-01 23:59:59.999999 UTC));
    }

    #[test]
    fn day_bounds_hold_on_the_last_representable_day() {
        let (start, end) = day_bounds(date!(9999-12-31));
        assert_eq!(start, datetime!(9999-12-31 00:00:00 UTC));
        assert_eq!(end, datetime!(9999-12-31 23:59:59.999999 UTC));
        assert!(is_storable(end));
    }

    #[test]
    fn storable_range_excludes_pre_epoch_years() {
        assert!(is_storable(datetime!(2024-01-01 00:00:00 UTC)));
        assert!(!is_storable(datetime!(1800-01-01 00:00:00 UTC)));
    }
}
