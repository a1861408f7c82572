//! Fixed-window request rate limiting
//!
//! Each `(client, operation)` pair gets a window that admits up to
//! `requests` calls during `interval`. Expired windows are swept
//! periodically so idle clients do not accumulate.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Requests admitted per interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u64,
    pub interval: Duration,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    interval: Duration,
    count: u64,
}

#[derive(Debug)]
struct Windows {
    by_client: HashMap<(String, String), Window>,
    last_sweep: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<Windows>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(Windows {
                by_client: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Count one call by `client` to `operation`; `false` if over the limit
    pub fn allow(&self, client: &str, operation: &str, limit: RateLimit) -> bool {
        self.allow_at(client, operation, limit, Instant::now())
    }

    fn allow_at(&self, client: &str, operation: &str, limit: RateLimit, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        if now.duration_since(windows.last_sweep) >= SWEEP_INTERVAL {
            windows
                .by_client
                .retain(|_, w| now.duration_since(w.started) < w.interval);
            windows.last_sweep = now;
        }

        let window = windows
            .by_client
            .entry((client.to_string(), operation.to_string()))
            .or_insert(Window {
                started: now,
                interval: limit.interval,
                count: 0,
            });
        if now.duration_since(window.started) >= window.interval {
            window.started = now;
            window.interval = limit.interval;
            window.count = 0;
        }
        if window.count >= limit.requests {
            return false;
        }
        window.count += 1;
        true
    }

    /// Number of tracked windows
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.lock().by_client.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
