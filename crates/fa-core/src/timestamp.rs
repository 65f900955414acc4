//! Microsecond epoch timestamps.
//!
//! All timestamps in the archive are microseconds since the Unix epoch,
//! carried as `u64`. At 10 kHz one frame lasts 100 µs, so microsecond
//! resolution leaves two digits of headroom below the frame period.

use std::time::{SystemTime, UNIX_EPOCH};

pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Current wall-clock time in microseconds since the epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in whole seconds since the epoch.
pub fn now_seconds() -> u64 {
    now_micros() / MICROS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        assert!(now_micros() > 1_577_836_800 * MICROS_PER_SEC);
        assert_eq!(now_seconds(), now_micros() / MICROS_PER_SEC);
    }
}
