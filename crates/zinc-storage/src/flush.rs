//! Deferred flush scheduling
//!
//! Appends are not synced individually. The first append after a flush
//! schedules one sync `max_delay` in the future; appends landing before that
//! deadline ride along with it. A zero delay means every append is synced
//! inline.

use crate::safe_io::FileGuard;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};
use zinc_common::Result;
use zinc_common::time::now_ns;

#[derive(Debug, Default)]
pub struct FlushScheduler {
    /// Monotonic ns at which the pending flush will start
    flush_start_time: AtomicI64,
    lock: Mutex<()>,
}

impl FlushScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a flush is scheduled in the future. Racy; only used to skip
    /// work early.
    #[must_use]
    pub fn flush_scheduled(&self) -> bool {
        self.flush_start_time.load(Ordering::Acquire) > now_ns()
    }

    /// Sync `file` after `max_delay`, unless a later flush is already
    /// scheduled. Blocks for the delay.
    ///
    /// Returns `Ok(true)` when this call performed the sync and `Ok(false)`
    /// when it was absorbed by an already scheduled flush.
    pub fn ensure_flush(&self, file: &FileGuard, max_delay: Duration) -> Result<bool> {
        if max_delay.is_zero() {
            file.sync()?;
            return Ok(true);
        }

        {
            let _lock = self.lock.lock();
            let now = now_ns();
            if self.flush_start_time.load(Ordering::Acquire) > now {
                return Ok(false);
            }
            let delay_ns = i64::try_from(max_delay.as_nanos()).unwrap_or(i64::MAX);
            self.flush_start_time
                .store(now.saturating_add(delay_ns), Ordering::Release);
        }

        let guard = file.increment();
        thread::sleep(max_delay);
        guard.sync()?;
        Ok(true)
    }

    /// Schedule a flush on a background thread holding its own descriptor
    /// reference. Errors are logged.
    pub fn ensure_flush_in_background(self: &Arc<Self>, file: &FileGuard, max_delay: Duration) {
        if max_delay.is_zero() {
            if let Err(e) = file.sync() {
                error!("Failed to flush {:?}: {}", file.path(), e);
            }
            return;
        }
        if self.flush_scheduled() {
            return;
        }

        let scheduler = Arc::clone(self);
        let guard = file.increment();
        thread::spawn(move || match scheduler.ensure_flush(&guard, max_delay) {
            Ok(true) => debug!("Flushed {:?}", guard.path()),
            Ok(false) => {}
            Err(e) => error!("Failed to flush {:?}: {}", guard.path(), e),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn open_guard() -> (tempfile::TempDir, FileGuard) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d1");
        std::fs::write(&path, b"data").unwrap();
        let guard = FileGuard::open_and_increment(&path).unwrap();
        (dir, guard)
    }

    #[test]
    fn test_zero_delay_flushes_inline() {
        let (_dir, guard) = open_guard();
        let scheduler = FlushScheduler::new();
        assert!(scheduler.ensure_flush(&guard, Duration::ZERO).unwrap());
        assert!(!scheduler.flush_scheduled());
    }

    #[test]
    fn test_concurrent_flushes_are_coalesced() {
        let (_dir, guard) = open_guard();
        let scheduler = Arc::new(FlushScheduler::new());
        let delay = Duration::from_millis(200);

        let first = {
            let scheduler = Arc::clone(&scheduler);
            let guard = guard.clone();
            thread::spawn(move || scheduler.ensure_flush(&guard, delay).unwrap())
        };

        // Wait for the first call to claim the slot
        let deadline = Instant::now() + Duration::from_secs(5);
        while !scheduler.flush_scheduled() {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }

        assert!(!scheduler.ensure_flush(&guard, delay).unwrap());
        assert!(first.join().unwrap());
    }

    #[test]
    fn test_background_flush_holds_its_own_reference() {
        let (_dir, guard) = open_guard();
        let scheduler = Arc::new(FlushScheduler::new());

        scheduler.ensure_flush_in_background(&guard, Duration::from_millis(100));
        assert!(guard.ref_count() >= 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while guard.ref_count() > 1 {
            assert!(Instant::now() < deadline, "background flush never finished");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!scheduler.flush_scheduled());
    }
}
