//! Enrichment events and the object-store timestamp they carry.
//!
//! An [`EnrichmentEvent`] is published once per qualifying image write and
//! names the object's physical path together with the write timestamp. The
//! consumer compares that timestamp with the one stored in the object's
//! metadata, so [`Timestamp`] equality is defined on the normalized form:
//! `"1402436408.9"` and `"1402436408.90000"` denote the same write.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Header carrying the write timestamp on every enrichment message
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// Header carrying a per-message correlation id
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// Timestamps are kept in units of 10 microseconds (5 decimal places)
const TICKS_PER_SECOND: u64 = 100_000;

/// Errors that can occur while parsing a timestamp
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("Invalid timestamp '{0}'")]
    Invalid(String),

    #[error("Negative timestamp '{0}' is not allowed")]
    Negative(String),
}

/// Errors that can occur while decoding an enrichment message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Message has no object path")]
    MissingPath,

    #[error("Object path is not valid UTF-8")]
    InvalidPath,

    #[error("Message has no {} header", TIMESTAMP_HEADER)]
    MissingTimestamp,

    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}

/// Object write timestamp with 10µs precision and an optional offset.
///
/// Ordering is total (ticks first, then offset). The canonical string form is
/// `%016.05f` seconds, followed by `_` and a 16 digit hex offset when the
/// offset is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    ticks: u64,
    offset: u64,
}

impl Timestamp {
    /// Sentinel used when a write carries no timestamp; never matches a real object
    pub const EPOCH: Timestamp = Timestamp {
        ticks: 0,
        offset: 0,
    };

    /// Convert a UTC datetime, rounding to the nearest 10µs
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let micros = dt.timestamp_micros().max(0) as u64;
        Self {
            ticks: (micros + 5) / 10,
            offset: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_epoch(&self) -> bool {
        *self == Self::EPOCH
    }

    /// Normalized seconds form without the offset, e.g. `1402436408.91203`
    pub fn normal(&self) -> String {
        format!(
            "{:010}.{:05}",
            self.ticks / TICKS_PER_SECOND,
            self.ticks % TICKS_PER_SECOND
        )
    }

    /// Canonical form including the offset when present
    pub fn internal(&self) -> String {
        if self.offset == 0 {
            self.normal()
        } else {
            format!("{}_{:016x}", self.normal(), self.offset)
        }
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.ticks / TICKS_PER_SECOND).ok()?;
        let nanos = (self.ticks % TICKS_PER_SECOND) as u32 * 10_000;
        DateTime::from_timestamp(secs, nanos)
    }

    /// ISO-8601 rendering for log output
    pub fn isoformat(&self) -> String {
        self.to_datetime()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
            .unwrap_or_else(|| self.normal())
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || TimestampError::Invalid(raw.to_string());

        let (seconds, offset) = match raw.split_once('_') {
            Some((seconds, offset)) => (
                seconds,
                u64::from_str_radix(offset, 16).map_err(|_| invalid())?,
            ),
            None => (raw, 0),
        };

        if seconds.starts_with('-') {
            return Err(TimestampError::Negative(raw.to_string()));
        }

        let (whole, frac) = seconds.split_once('.').unwrap_or((seconds, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
            return Err(invalid());
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };

        // Five significant fractional digits, rounding on the sixth
        let mut digits = frac.bytes().map(|b| u64::from(b - b'0'));
        let mut frac_ticks = 0u64;
        for _ in 0..5 {
            frac_ticks = frac_ticks * 10 + digits.next().unwrap_or(0);
        }
        if digits.next().unwrap_or(0) >= 5 {
            frac_ticks += 1;
        }

        let ticks = whole
            .checked_mul(TICKS_PER_SECOND)
            .and_then(|t| t.checked_add(frac_ticks))
            .ok_or_else(invalid)?;

        Ok(Self { ticks, offset })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.internal())
    }
}

/// Request to classify the image stored at `path`, written at `timestamp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentEvent {
    /// Physical path of the object on the storage device
    pub path: String,
    /// Timestamp of the write that produced this event
    pub timestamp: Timestamp,
}

impl EnrichmentEvent {
    pub fn new(path: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            path: path.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_normalizes_precision() {
        let short: Timestamp = "1402436408.9".parse().unwrap();
        let long: Timestamp = "1402436408.90000".parse().unwrap();
        let padded: Timestamp = "0000001402436408.90000".parse().unwrap();

        assert_eq!(short, long);
        assert_eq!(long, padded);
        assert_eq!(short.normal(), "1402436408.90000");
    }

    #[test]
    fn test_parse_rounds_sixth_digit() {
        let ts: Timestamp = "1402436408.912035".parse().unwrap();
        assert_eq!(ts.normal(), "1402436408.91204");

        let ts: Timestamp = "1402436408.912034".parse().unwrap();
        assert_eq!(ts.normal(), "1402436408.91203");
    }

    #[test]
    fn test_offset_round_trips_through_internal_form() {
        let ts: Timestamp = "1402436408.91203_00000000000000ff".parse().unwrap();
        assert_eq!(ts.offset(), 255);
        assert_eq!(ts.internal(), "1402436408.91203_00000000000000ff");
        assert_ne!(ts, "1402436408.91203".parse::<Timestamp>().unwrap());
    }

    #[test]
    fn test_ordering_is_total() {
        let a: Timestamp = "1402436408.91203".parse().unwrap();
        let b: Timestamp = "1402436408.91204".parse().unwrap();
        let a_offset: Timestamp = "1402436408.91203_0000000000000001".parse().unwrap();
        assert!(a < b);
        assert!(a < a_offset);
        assert!(a_offset < b);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            "yesterday".parse::<Timestamp>(),
            Err(TimestampError::Invalid(_))
        ));
        assert!(matches!(
            "-1.0".parse::<Timestamp>(),
            Err(TimestampError::Negative(_))
        ));
        assert!("".parse::<Timestamp>().is_err());
        assert!("1.0_".parse::<Timestamp>().is_err());
        assert!("1.2.3".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_epoch_sentinel() {
        let zero: Timestamp = "0".parse().unwrap();
        assert!(zero.is_epoch());
        assert_eq!(Timestamp::EPOCH.normal(), "0000000000.00000");
        assert!(!"0.00001".parse::<Timestamp>().unwrap().is_epoch());
    }

    #[test]
    fn test_datetime_conversion() {
        let dt = Utc.with_ymd_and_hms(2016, 5, 20, 12, 0, 0).unwrap();
        let ts = Timestamp::from_datetime(dt);
        assert_eq!(ts.normal(), "1463745600.00000");
        assert_eq!(ts.isoformat(), "2016-05-20T12:00:00.000000Z");
    }
}
