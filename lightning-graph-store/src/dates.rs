//! Timestamps as stored in rows, and the decrementing number that orders keys
//! newest first.

use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::Error;

/// Width of a decrementing number in hex characters
pub const DECREMENTING_NUMBER_LEN: usize = 16;

const NANOS_PER_MILLI: i128 = 1_000_000;

/// Current time, truncated to millisecond precision
pub fn now() -> OffsetDateTime {
    // millisecond truncation of a valid time is always representable
    truncate_to_millis(OffsetDateTime::now_utc()).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn truncate_to_millis(date: OffsetDateTime) -> Result<OffsetDateTime, Error> {
    from_unix_millis(unix_millis(&date))
}

/// Milliseconds since the unix epoch, rounded down
pub fn unix_millis(date: &OffsetDateTime) -> i128 {
    date.unix_timestamp_nanos().div_euclid(NANOS_PER_MILLI)
}

pub fn from_unix_millis(millis: i128) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp_nanos(millis * NANOS_PER_MILLI)
        .map_err(|e| Error::InvalidDate(format!("{} ms: {}", millis, e)))
}

/// ISO 8601 in UTC with exactly three fractional digits.
///
/// The fixed width keeps lexical order equal to chronological order.
pub fn to_iso(date: &OffsetDateTime) -> Result<String, Error> {
    date.to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
        ))
        .map_err(|e| Error::InvalidDate(e.to_string()))
}

pub fn parse_iso(date: &str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::parse(date, &Rfc3339)
        .map_err(|e| Error::InvalidDate(format!("{}: {}", date, e)))
        .and_then(truncate_to_millis)
}

/// Whether `since` lies less than `window` before `now`
pub fn is_within(since: &OffsetDateTime, now: &OffsetDateTime, window: Duration) -> bool {
    *now - *since < window
}

/// Encode a time as `u64::MAX - unix_millis`, in fixed width hex.
///
/// Later times produce lexically smaller numbers.
pub fn decrementing_number(date: &OffsetDateTime) -> Result<String, Error> {
    let millis = unix_millis(date);
    let millis = u64::try_from(millis)
        .map_err(|_| Error::InvalidDate(format!("{} precedes the unix epoch", millis)))?;
    Ok(format!("{:016x}", u64::MAX - millis))
}

/// Inverse of [`decrementing_number`]
pub fn date_for_decrementing_number(number: &str) -> Result<OffsetDateTime, Error> {
    if number.len() != DECREMENTING_NUMBER_LEN || !number.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidDate(format!("malformed decrementing number {}", number)));
    }
    let n = u64::from_str_radix(number, 16)
        .map_err(|e| Error::InvalidDate(format!("decrementing number {}: {}", number, e)))?;
    from_unix_millis(i128::from(u64::MAX - n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn decrementing_number_known_dates() {
        let date = parse_iso("2008-10-31T18:10:00.000Z").unwrap();
        assert_eq!(decrementing_number(&date).unwrap(), "fffffee2abe70f3f");
        assert_eq!(date_for_decrementing_number("fffffee2abe70f3f").unwrap(), date);

        let genesis = datetime!(2009-01-08 19:27:40 UTC);
        assert_eq!(decrementing_number(&genesis).unwrap(), "fffffee14849281f");
        assert_eq!(to_iso(&date_for_decrementing_number("fffffee14849281f").unwrap()).unwrap(), "2009-01-08T19:27:40.000Z");
    }

    #[test]
    fn decrementing_number_orders_newest_first() {
        let t1 = datetime!(2021-03-01 00:00:00.001 UTC);
        let t2 = datetime!(2021-03-01 00:00:00.002 UTC);
        assert!(decrementing_number(&t1).unwrap() > decrementing_number(&t2).unwrap());
    }

    #[test]
    fn decrementing_number_rejects_bad_input() {
        assert!(decrementing_number(&datetime!(1969-12-31 23:59:59 UTC)).is_err());
        assert!(date_for_decrementing_number("").is_err());
        assert!(date_for_decrementing_number("fffffee2abe70f3").is_err());
        assert!(date_for_decrementing_number("zzzzzzzzzzzzzzzz").is_err());
        assert!(date_for_decrementing_number("+fffffee2abe70f3").is_err());
        // beyond the last representable date
        assert!(date_for_decrementing_number("0000000000000000").is_err());
    }

    #[test]
    fn iso_is_fixed_width() {
        let date = parse_iso("2020-01-02T03:04:05Z").unwrap();
        assert_eq!(to_iso(&date).unwrap(), "2020-01-02T03:04:05.000Z");
        let date = parse_iso("2020-01-02T05:04:05.123456+02:00").unwrap();
        assert_eq!(to_iso(&date).unwrap(), "2020-01-02T03:04:05.123Z");
        assert!(parse_iso("yesterday").is_err());
    }
}
