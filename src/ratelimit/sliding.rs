//! In-process sliding-window-log admission.

use std::collections::VecDeque;
use tracing::trace;

use super::registry::{IdentityRegistry, IdentityState};
use super::WINDOW_MS;

/// Timestamps of admitted requests inside the trailing window.
#[derive(Debug, Default)]
pub struct SlidingWindowLog {
    timestamps: VecDeque<i64>,
}

impl SlidingWindowLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prune expired entries and admit if fewer than `limit` remain.
    ///
    /// Entries are dropped once `now - ts >= WINDOW_MS`. Pruning is purely
    /// time-based, so a limit that changes between calls needs no migration.
    pub fn try_admit(&mut self, limit: u64, now_millis: i64) -> bool {
        self.prune(now_millis);

        if self.timestamps.len() as u64 >= limit {
            return false;
        }

        self.timestamps.push_back(now_millis);
        true
    }

    fn prune(&mut self, now_millis: i64) {
        // retain rather than pop_front: a clock stepping backwards can leave
        // the log out of order.
        self.timestamps.retain(|&ts| now_millis - ts < WINDOW_MS);
    }

    /// Number of admissions currently recorded.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

impl IdentityState for SlidingWindowLog {
    fn is_idle(&self, now_millis: i64) -> bool {
        self.timestamps
            .iter()
            .all(|&ts| now_millis - ts >= 2 * WINDOW_MS)
    }
}

/// Per-identity sliding-window-log tracker.
///
/// Each identity gets its own log behind its own lock; the limit is supplied
/// on every call and may change between calls.
#[derive(Default)]
pub struct LocalSlidingTracker {
    logs: IdentityRegistry<SlidingWindowLog>,
}

impl LocalSlidingTracker {
    pub fn new() -> Self {
        Self {
            logs: IdentityRegistry::new(),
        }
    }

    /// Decide admission for one request from `identity`.
    ///
    /// `limit` must be positive; the facade filters anything else.
    pub fn check(&self, identity: &str, limit: u64, now_millis: i64) -> bool {
        let (admitted, in_window) = self.logs.with_state(identity, SlidingWindowLog::new, |log| {
            let admitted = log.try_admit(limit, now_millis);
            (admitted, log.len())
        });

        trace!(
            identity = %identity,
            limit = limit,
            in_window = in_window,
            admitted = admitted,
            "Sliding window decision"
        );

        admitted
    }

    /// Admissions currently inside the window for `identity`, if tracked.
    pub fn in_window(&self, identity: &str, now_millis: i64) -> Option<usize> {
        self.logs.peek(identity, |log| {
            log.prune(now_millis);
            log.len()
        })
    }

    pub fn evict_idle(&self, now_millis: i64) -> usize {
        self.logs.evict_idle(now_millis)
    }

    pub fn tracked(&self) -> usize {
        self.logs.len()
    }

    pub fn clear(&self) {
        self.logs.clear();
    }
}
