//! Monotonic unix timestamps
//!
//! The wall clock is sampled once and then advanced with [`Instant`], so the
//! values returned here never go backwards even if the system clock is
//! adjusted while the process runs.

use std::sync::LazyLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

struct ClockAnchor {
    unix_ns: i64,
    instant: Instant,
}

static ANCHOR: LazyLock<ClockAnchor> = LazyLock::new(|| {
    let unix_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
    ClockAnchor {
        unix_ns,
        instant: Instant::now(),
    }
});

/// Current unix time in nanoseconds.
#[must_use]
pub fn now_ns() -> i64 {
    let anchor = &*ANCHOR;
    let elapsed = i64::try_from(anchor.instant.elapsed().as_nanos()).unwrap_or(i64::MAX);
    anchor.unix_ns.saturating_add(elapsed)
}

/// Current unix time in microseconds.
#[must_use]
pub fn now_us() -> i64 {
    now_ns() / 1_000
}

/// Current unix time in milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    now_ns() / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut last = now_ns();
        for _ in 0..1000 {
            let next = now_ns();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn test_granularities_agree() {
        let us = now_us();
        let ms = now_ms();
        assert!(us / 1000 >= ms - 1);
        // Sometime after 2017-01-01
        assert!(us > 1_483_228_800_000_000);
    }
}
