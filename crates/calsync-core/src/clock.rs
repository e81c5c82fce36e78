//! # Revision Clock
//!
//! Timestamps are kept at millisecond resolution because that is what the
//! local store persists. Truncating here means a value read back from SQLite
//! compares equal to the value that was written.
//!
//! `updated_at` must strictly increase on every mutation of a record, even
//! when two edits land in the same millisecond or the wall clock steps back.

use chrono::{DateTime, Duration, Utc};

/// Current time truncated to whole milliseconds.
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Drops sub-millisecond precision.
pub fn truncate(instant: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(instant.timestamp_millis()).unwrap_or(instant)
}

/// Converts stored epoch milliseconds back into a timestamp.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// Next `updated_at` for a record whose current revision is `previous`.
///
/// Returns the wall clock when it is ahead, otherwise `previous + 1ms`.
pub fn next_revision(previous: DateTime<Utc>) -> DateTime<Utc> {
    next_revision_at(previous, now())
}

/// [`next_revision`] with an explicit clock reading.
pub fn next_revision_at(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate(now);
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_drops_micros() {
        let t = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate(t);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(from_millis(truncated.timestamp_millis()), Some(truncated));
    }

    #[test]
    fn test_next_revision_is_strictly_increasing() {
        let previous = from_millis(10_000).unwrap();

        // Clock behind the record (skew): bump by one millisecond
        let behind = from_millis(5_000).unwrap();
        assert_eq!(next_revision_at(previous, behind), from_millis(10_001).unwrap());

        // Same millisecond
        assert_eq!(next_revision_at(previous, previous), from_millis(10_001).unwrap());

        // Clock ahead: take the clock
        let ahead = from_millis(20_000).unwrap();
        assert_eq!(next_revision_at(previous, ahead), ahead);
    }
}
