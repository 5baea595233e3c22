//! Admission decision entry point.

use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::distributed::DistributedLimiter;
use super::leaky::LocalLeakyTracker;
use super::mode::{Algorithm, ModeSelector};
use super::overrides::LimitOverrides;
use super::redis_store::{RedisCounterStore, RedisTarget};
use super::sliding::LocalSlidingTracker;
use crate::error::Result;

/// The admission facade.
///
/// Resolves the effective limit for an identity (override first, caller
/// default otherwise), picks the distributed backend when a remote store is
/// configured and the local trackers otherwise, and applies the selected
/// algorithm. This struct is thread-safe and meant to be shared behind an
/// `Arc`.
pub struct RateLimiter {
    /// Per-identity limit overrides
    overrides: LimitOverrides,
    /// Algorithm in effect for every identity
    mode: ModeSelector,
    /// Local sliding-window-log state
    sliding: LocalSlidingTracker,
    /// Local leaky-bucket state
    leaky: LocalLeakyTracker,
    /// Shared-store backend; `None` means purely local decisions
    remote: RwLock<Option<Arc<DistributedLimiter>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a local rate limiter using the system clock and sliding mode.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a local rate limiter reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            overrides: LimitOverrides::new(),
            mode: ModeSelector::default(),
            sliding: LocalSlidingTracker::new(),
            leaky: LocalLeakyTracker::new(),
            remote: RwLock::new(None),
            clock,
        }
    }

    /// Start in `algorithm` instead of sliding mode.
    pub fn with_mode(self, algorithm: Algorithm) -> Self {
        self.mode.set(algorithm);
        self
    }

    /// Make every decision against a shared store.
    pub fn with_remote(self, remote: DistributedLimiter) -> Self {
        self.set_remote(Some(remote));
        self
    }

    /// Decide whether one request from `identity` may proceed.
    ///
    /// A non-positive `default_limit` is always denied. Remote-store failures
    /// are denied as well.
    pub async fn decide(&self, identity: &str, default_limit: i64) -> bool {
        self.decide_with_limit(identity, default_limit).await.0
    }

    /// Like [`decide`](Self::decide), also returning the limit that was
    /// enforced (`None` when the request was denied for a non-positive limit).
    pub async fn decide_with_limit(
        &self,
        identity: &str,
        default_limit: i64,
    ) -> (bool, Option<u64>) {
        let Some(limit) = self.effective_limit(identity, default_limit) else {
            debug!(
                identity = %identity,
                default_limit = default_limit,
                "Non-positive limit, denying request"
            );
            return (false, None);
        };

        let now = self.clock.now_millis();
        let algorithm = self.mode.get();
        let remote = self.remote.read().clone();

        trace!(
            identity = %identity,
            limit = limit,
            algorithm = %algorithm,
            distributed = remote.is_some(),
            "Checking rate limit"
        );

        let admitted = match remote {
            Some(remote) => remote.check(identity, limit, algorithm, now).await,
            None => match algorithm {
                Algorithm::Sliding => self.sliding.check(identity, limit, now),
                Algorithm::Leaky => self.leaky.check(identity, limit, now),
            },
        };

        if !admitted {
            debug!(identity = %identity, limit = limit, "Rate limit exceeded");
        }
        (admitted, Some(limit))
    }

    /// The limit `decide` would enforce, or `None` if it would deny outright.
    pub fn effective_limit(&self, identity: &str, default_limit: i64) -> Option<u64> {
        let default_limit = u64::try_from(default_limit).ok().filter(|&l| l > 0)?;
        Some(
            self.overrides
                .get_override(identity)
                .filter(|&l| l > 0)
                .unwrap_or(default_limit),
        )
    }

    /// Set a per-identity limit that replaces the caller default.
    pub fn set_override(&self, identity: &str, limit: u64) {
        self.overrides.set_override(identity, limit);
    }

    pub fn get_override(&self, identity: &str) -> Option<u64> {
        self.overrides.get_override(identity)
    }

    /// Apply overrides from a JSON file mapping identities to limits.
    pub fn load_overrides<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        self.overrides.load_from_definition(path)
    }

    pub fn overrides(&self) -> &LimitOverrides {
        &self.overrides
    }

    /// Switch algorithm by name; unknown names are ignored.
    ///
    /// Returns the algorithm in effect afterwards.
    pub fn set_mode(&self, mode: &str) -> Algorithm {
        self.mode.set_mode(mode)
    }

    pub fn get_mode(&self) -> &'static str {
        self.mode.get_mode()
    }

    pub fn mode(&self) -> Algorithm {
        self.mode.get()
    }

    /// Point this limiter at a Redis store.
    ///
    /// No connection is made here; an unreachable store only causes
    /// individual decisions to be denied.
    pub fn configure_remote_store(&self, address: &str, credential: &str, db: i64) -> Result<()> {
        let target = RedisTarget::new(address, Some(credential.to_string()), db);
        let store = RedisCounterStore::new(&target)?;
        self.set_remote(Some(DistributedLimiter::new(Arc::new(store))));
        Ok(())
    }

    /// Replace (or with `None`, remove) the distributed backend.
    pub fn set_remote(&self, remote: Option<DistributedLimiter>) {
        let distributed = remote.is_some();
        *self.remote.write() = remote.map(Arc::new);
        info!(distributed = distributed, "Admission backend selected");
    }

    pub fn is_distributed(&self) -> bool {
        self.remote.read().is_some()
    }

    /// Drop local state for identities that have gone quiet.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let removed = self.sliding.evict_idle(now) + self.leaky.evict_idle(now);
        if removed > 0 {
            debug!(removed = removed, "Evicted idle identities");
        }
        removed
    }

    /// Number of identities with local state across both algorithms.
    pub fn tracked_identities(&self) -> usize {
        self.sliding.tracked() + self.leaky.tracked()
    }

    /// Drop all local admission state. Overrides are kept.
    pub fn clear(&self) {
        self.sliding.clear();
        self.leaky.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
