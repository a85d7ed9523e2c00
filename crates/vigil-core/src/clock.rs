//! Timestamp plumbing shared by the history ring and the registry.
//!
//! Timestamps travel as nanoseconds: unsigned since the Unix epoch for
//! liveness publication, signed relative to a recorder's creation for ring
//! slots. Signed storage means a backward clock step still produces a
//! storable value instead of a panic.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch, saturating at the representable range.
pub(crate) fn nanos_since_epoch(t: SystemTime) -> u64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => u64::try_from(d.as_nanos()).unwrap_or(u64::MAX),
        Err(_) => 0,
    }
}

/// Inverse of [`nanos_since_epoch`].
pub(crate) fn time_from_epoch_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// A `Duration` as saturating nanoseconds.
pub(crate) fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Signed nanoseconds from `earlier` to `later`; negative when the clock
/// stepped backward between the two readings.
pub(crate) fn signed_nanos_between(earlier: SystemTime, later: SystemTime) -> i64 {
    match later.duration_since(earlier) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_nanos()).map_or(i64::MIN, |n| -n),
    }
}

/// Applies a signed nanosecond offset to a timestamp.
pub(crate) fn offset_by_nanos(t: SystemTime, nanos: i64) -> SystemTime {
    if nanos >= 0 {
        t + Duration::from_nanos(nanos.unsigned_abs())
    } else {
        t - Duration::from_nanos(nanos.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_nanos_round_trip() {
        let now = SystemTime::now();
        let nanos = nanos_since_epoch(now);
        let back = time_from_epoch_nanos(nanos);
        // Sub-nanosecond precision is not representable, so allow equality only.
        assert_eq!(nanos, nanos_since_epoch(back));
    }

    #[test]
    fn test_signed_nanos_forward_and_backward() {
        let t = SystemTime::now();
        let later = t + Duration::from_micros(5);
        assert_eq!(signed_nanos_between(t, later), 5_000);
        assert_eq!(signed_nanos_between(later, t), -5_000);
    }

    #[test]
    fn test_offset_negative_nanos() {
        let t = SystemTime::now();
        let back = offset_by_nanos(t, -1_000);
        assert_eq!(signed_nanos_between(back, t), 1_000);
    }
}
