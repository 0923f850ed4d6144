//! Common types used across the workspace
//!
//! Timestamps cross two boundaries: SQLite, which has no native timestamp
//! type, and JSON output. Both use integer epoch offsets so ordering is
//! numeric.

use crate::error::{QuakeError, Result};
use chrono::{DateTime, SubsecRound, Utc};

/// Microseconds since the Unix epoch
pub fn to_epoch_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Inverse of [`to_epoch_micros`]
pub fn from_epoch_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or(QuakeError::TimestampOutOfRange(micros))
}

/// Whole seconds since the Unix epoch
pub fn from_epoch_seconds(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(QuakeError::TimestampOutOfRange(secs))
}

/// Drop sub-microsecond precision so a timestamp survives a storage round trip unchanged
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Current time at storage precision
pub fn now_micros() -> DateTime<Utc> {
    truncate_to_micros(Utc::now())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_micros_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(from_epoch_micros(to_epoch_micros(ts)).unwrap(), ts);
    }

    #[test]
    fn test_from_epoch_seconds() {
        let ts = from_epoch_seconds(1000).unwrap();
        assert_eq!(ts.to_rfc3339(), "1970-01-01T00:16:40+00:00");
        assert!(from_epoch_seconds(i64::MAX).is_err());
    }

    #[test]
    fn test_truncate_to_micros() {
        let ts = Utc.timestamp_opt(10, 123_456_789).unwrap();
        assert_eq!(truncate_to_micros(ts).timestamp_subsec_nanos(), 123_456_000);

        let now = now_micros();
        assert_eq!(truncate_to_micros(now), now);
    }
}
