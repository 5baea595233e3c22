//! In-process leaky-bucket admission with continuous refill.

use tracing::trace;

use super::registry::{IdentityRegistry, IdentityState};
use super::WINDOW_MS;

/// Token pool for one identity.
///
/// Holds `capacity` tokens at most and regains `capacity / 1000` tokens per
/// millisecond; every admission spends one.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    tokens: f64,
    last_refill_millis: i64,
    capacity: f64,
    refill_per_milli: f64,
}

impl LeakyBucket {
    /// A full bucket for `limit` requests per window.
    pub fn new(limit: u64, now_millis: i64) -> Self {
        let capacity = limit as f64;
        Self {
            tokens: capacity,
            last_refill_millis: now_millis,
            capacity,
            refill_per_milli: capacity / WINDOW_MS as f64,
        }
    }

    /// Refill for the elapsed time, then spend a token if one is available.
    pub fn try_admit(&mut self, limit: u64, now_millis: i64) -> bool {
        self.resize(limit);
        self.refill(now_millis);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn resize(&mut self, limit: u64) {
        let capacity = limit as f64;
        if capacity != self.capacity {
            self.capacity = capacity;
            self.refill_per_milli = capacity / WINDOW_MS as f64;
            self.tokens = self.tokens.min(capacity);
        }
    }

    fn refill(&mut self, now_millis: i64) {
        let elapsed = (now_millis - self.last_refill_millis).max(0) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_per_milli).min(self.capacity);
        self.last_refill_millis = now_millis;
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

impl IdentityState for LeakyBucket {
    fn is_idle(&self, now_millis: i64) -> bool {
        // A window without activity refills any bucket completely.
        now_millis - self.last_refill_millis >= 2 * WINDOW_MS
    }
}

/// Per-identity leaky-bucket tracker.
#[derive(Default)]
pub struct LocalLeakyTracker {
    buckets: IdentityRegistry<LeakyBucket>,
}

impl LocalLeakyTracker {
    pub fn new() -> Self {
        Self {
            buckets: IdentityRegistry::new(),
        }
    }

    /// Decide admission for one request from `identity`.
    pub fn check(&self, identity: &str, limit: u64, now_millis: i64) -> bool {
        let (admitted, tokens) = self.buckets.with_state(
            identity,
            || LeakyBucket::new(limit, now_millis),
            |bucket| {
                let admitted = bucket.try_admit(limit, now_millis);
                (admitted, bucket.tokens())
            },
        );

        trace!(
            identity = %identity,
            limit = limit,
            tokens = tokens,
            admitted = admitted,
            "Leaky bucket decision"
        );

        admitted
    }

    /// Snapshot of the identity's bucket, if tracked.
    pub fn bucket(&self, identity: &str) -> Option<LeakyBucket> {
        self.buckets.peek(identity, |bucket| bucket.clone())
    }

    pub fn evict_idle(&self, now_millis: i64) -> usize {
        self.buckets.evict_idle(now_millis)
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_burst_up_to_capacity() {
        let tracker = LocalLeakyTracker::new();

        for i in 1..=5 {
            assert!(tracker.check("user", 5, 0), "request {} should be admitted", i);
        }
        assert!(!tracker.check("user", 5, 0));
    }

    #[test]
    fn test_partial_second_recovery() {
        let tracker = LocalLeakyTracker::new();

        for _ in 0..10 {
            assert!(tracker.check("user", 10, 0));
        }
        assert!(!tracker.check("user", 10, 50));

        // 10 per second refills one token every 100ms.
        assert!(tracker.check("user", 10, 100));
        assert!(!tracker.check("user", 10, 150));
        assert!(tracker.check("user", 10, 200));
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let mut bucket = LeakyBucket::new(4, 0);

        for now in (0..20_000).step_by(37) {
            bucket.try_admit(4, now);
            assert!(bucket.tokens() >= 0.0);
            assert!(bucket.tokens() <= bucket.capacity());
        }

        // A long idle period never overfills.
        bucket.try_admit(4, 1_000_000);
        assert!(bucket.tokens() <= 4.0);
    }

    #[test]
    fn test_admissions_bounded_by_capacity_plus_refill() {
        let tracker = LocalLeakyTracker::new();
        let limit = 8;
        let mut admitted = 0u64;

        // 1000 calls spread over 500ms.
        for i in 0..1000 {
            if tracker.check("user", limit, i / 2) {
                admitted += 1;
            }
        }

        let interval_ms = 500;
        let bound = limit + (limit * interval_ms) / 1000;
        assert!(admitted <= bound, "admitted {} > bound {}", admitted, bound);
        assert!(admitted >= limit);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let mut bucket = LeakyBucket::new(2, 1_000);

        assert!(bucket.try_admit(2, 1_000));
        assert!(bucket.try_admit(2, 1_000));
        assert!(!bucket.try_admit(2, 500));
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_shrinking_limit_clamps_tokens() {
        let tracker = LocalLeakyTracker::new();

        assert!(tracker.check("user", 10, 0));
        let bucket = tracker.bucket("user").unwrap();
        assert_eq!(bucket.tokens(), 9.0);

        assert!(tracker.check("user", 3, 0));
        let bucket = tracker.bucket("user").unwrap();
        assert_eq!(bucket.capacity(), 3.0);
        assert_eq!(bucket.tokens(), 2.0);
    }

    #[test]
    fn test_growing_limit_does_not_invent_tokens() {
        let tracker = LocalLeakyTracker::new();

        assert!(tracker.check("user", 1, 0));
        assert!(!tracker.check("user", 1, 0));

        // Capacity grows, but the pool only refills with time.
        assert!(!tracker.check("user", 100, 0));
        assert!(tracker.check("user", 100, 10));
    }

    #[test]
    fn test_concurrent_checks_respect_capacity() {
        let tracker = Arc::new(LocalLeakyTracker::new());
        let admitted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    if tracker.check("hot", 10, 7) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_idle_bucket_is_evicted() {
        let tracker = LocalLeakyTracker::new();
        tracker.check("user", 3, 0);

        assert_eq!(tracker.evict_idle(1_000), 0);
        assert_eq!(tracker.evict_idle(2_000), 1);
        assert!(tracker.bucket("user").is_none());
    }
}
