//! Shared counter store abstraction for distributed admission.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::leaky::LeakyBucket;
use super::mode::Algorithm;
use super::sliding::SlidingWindowLog;
use crate::error::Result;

/// One atomic check-and-increment against the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCheck {
    /// Namespaced key for the identity
    pub key: String,
    /// Which admission algorithm the key represents
    pub algorithm: Algorithm,
    /// Effective limit for this call
    pub limit: u64,
    /// Caller's current time in epoch milliseconds
    pub now_millis: i64,
    /// Length of the rolling window
    pub window_millis: i64,
    /// Expiry applied to the key on admission
    pub expiry_millis: i64,
    /// Globally unique marker recorded for an admission
    pub member: String,
}

/// A store that can decide and record an admission in one indivisible step.
///
/// Implementations must make the prune, count and conditional insert appear
/// atomic to every other caller of the same key, across processes.
#[async_trait]
pub trait RemoteCounterStore: Send + Sync {
    /// Returns `Ok(true)` if the request was admitted and recorded.
    async fn check_and_increment(&self, check: &RemoteCheck) -> Result<bool>;
}

enum MemoryEntry {
    Sliding(SlidingWindowLog),
    Leaky(LeakyBucket),
}

struct ExpiringEntry {
    entry: MemoryEntry,
    expires_at: i64,
}

#[derive(Default)]
struct Entries {
    keys: HashMap<String, ExpiringEntry>,
    /// Earliest time the next expiry sweep may run.
    next_sweep_at: i64,
}

impl Entries {
    /// Drop every expired key, at most once per window.
    fn sweep(&mut self, now_millis: i64, window_millis: i64) {
        if now_millis < self.next_sweep_at {
            return;
        }
        self.keys.retain(|_, e| e.expires_at > now_millis);
        self.next_sweep_at = now_millis + window_millis;
    }
}

/// In-process store honouring the same atomic contract as Redis.
///
/// Several limiter instances holding the same `Arc<MemoryCounterStore>`
/// behave like processes sharing one remote store.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<Entries>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys at `now_millis`.
    pub fn live_keys(&self, now_millis: i64) -> usize {
        self.entries
            .lock()
            .keys
            .values()
            .filter(|e| e.expires_at > now_millis)
            .count()
    }

    /// Number of keys held in memory, expired or not.
    pub fn stored_keys(&self) -> usize {
        self.entries.lock().keys.len()
    }
}

#[async_trait]
impl RemoteCounterStore for MemoryCounterStore {
    async fn check_and_increment(&self, check: &RemoteCheck) -> Result<bool> {
        let mut entries = self.entries.lock();
        let now = check.now_millis;

        entries.sweep(now, check.window_millis);
        if entries
            .keys
            .get(&check.key)
            .map_or(false, |e| e.expires_at <= now)
        {
            entries.keys.remove(&check.key);
        }

        let slot = entries
            .keys
            .entry(check.key.clone())
            .or_insert_with(|| ExpiringEntry {
                entry: match check.algorithm {
                    Algorithm::Sliding => MemoryEntry::Sliding(SlidingWindowLog::new()),
                    Algorithm::Leaky => MemoryEntry::Leaky(LeakyBucket::new(check.limit, now)),
                },
                expires_at: now + check.expiry_millis,
            });

        let admitted = match &mut slot.entry {
            MemoryEntry::Sliding(log) => log.try_admit(check.limit, now),
            MemoryEntry::Leaky(bucket) => bucket.try_admit(check.limit, now),
        };

        if admitted {
            slot.expires_at = now + check.expiry_millis;
        }

        Ok(admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(key: &str, algorithm: Algorithm, limit: u64, now_millis: i64) -> RemoteCheck {
        RemoteCheck {
            key: key.to_string(),
            algorithm,
            limit,
            now_millis,
            window_millis: 1000,
            expiry_millis: 2000,
            member: format!("{}-{}", key, now_millis),
        }
    }

    #[tokio::test]
    async fn test_memory_store_sliding() {
        let store = MemoryCounterStore::new();

        for _ in 0..3 {
            assert!(store
                .check_and_increment(&check("rate:a", Algorithm::Sliding, 3, 100))
                .await
                .unwrap());
        }
        assert!(!store
            .check_and_increment(&check("rate:a", Algorithm::Sliding, 3, 100))
            .await
            .unwrap());
        assert!(store
            .check_and_increment(&check("rate:a", Algorithm::Sliding, 3, 1_100))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_leaky() {
        let store = MemoryCounterStore::new();

        assert!(store
            .check_and_increment(&check("rate:leaky:a", Algorithm::Leaky, 1, 0))
            .await
            .unwrap());
        assert!(!store
            .check_and_increment(&check("rate:leaky:a", Algorithm::Leaky, 1, 500))
            .await
            .unwrap());
        assert!(store
            .check_and_increment(&check("rate:leaky:a", Algorithm::Leaky, 1, 1_000))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_keys_expire() {
        let store = MemoryCounterStore::new();

        store
            .check_and_increment(&check("rate:a", Algorithm::Sliding, 1, 0))
            .await
            .unwrap();
        assert_eq!(store.live_keys(1_999), 1);
        assert_eq!(store.live_keys(2_000), 0);
    }

    #[tokio::test]
    async fn test_memory_store_purges_idle_keys() {
        let store = MemoryCounterStore::new();

        for i in 0..1000 {
            let key = format!("rate:user-{}", i);
            assert!(store
                .check_and_increment(&check(&key, Algorithm::Sliding, 5, 0))
                .await
                .unwrap());
        }
        assert_eq!(store.stored_keys(), 1000);

        // Expired keys are swept when any key is touched after they lapse.
        assert!(store
            .check_and_increment(&check("rate:late", Algorithm::Sliding, 5, 1_000_000))
            .await
            .unwrap());
        assert_eq!(store.live_keys(1_000_000), 1);
        assert_eq!(store.stored_keys(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_keeps_live_keys_on_sweep() {
        let store = MemoryCounterStore::new();

        store
            .check_and_increment(&check("rate:old", Algorithm::Sliding, 5, 0))
            .await
            .unwrap();
        store
            .check_and_increment(&check("rate:fresh", Algorithm::Sliding, 5, 1_500))
            .await
            .unwrap();

        // At 2_500 only `rate:old` (expires at 2_000) has lapsed.
        store
            .check_and_increment(&check("rate:other", Algorithm::Sliding, 5, 2_500))
            .await
            .unwrap();
        assert_eq!(store.stored_keys(), 2);
        assert_eq!(store.live_keys(2_500), 2);
    }
}
