//! Rate limiter for repeated pod delete calls.
//!
//! Once a delete succeeds (or the pod is already gone), further delete
//! attempts for the same pod are suppressed until the minimum repeat period
//! has passed. A failed delete is deliberately not recorded so the next tick
//! retries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct RecentlyDeletedCache {
    deleted: Mutex<HashMap<String, Instant>>,
}

impl RecentlyDeletedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a delete for `key` was recorded within `period`.
    pub fn deleted_recently(&self, key: &str, period: Duration) -> bool {
        self.deleted
            .lock()
            .unwrap()
            .get(key)
            .map(|at| at.elapsed() < period)
            .unwrap_or(false)
    }

    pub fn record(&self, key: &str) {
        self.deleted
            .lock()
            .unwrap()
            .insert(key.to_string(), Instant::now());
    }

    /// Drop entries older than `period`; the suppression window has passed so
    /// there is nothing left to remember.
    pub fn prune(&self, period: Duration) {
        self.deleted
            .lock()
            .unwrap()
            .retain(|_, at| at.elapsed() < period);
    }
}
