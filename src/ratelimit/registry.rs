//! Concurrent identity-keyed state registry.
//!
//! Each identity owns one `Mutex`-guarded state record. Creation goes through
//! the `DashMap` entry API, so concurrent first callers for an unseen identity
//! always converge on a single state instance.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Per-identity state that knows when it no longer matters.
pub trait IdentityState: Send {
    /// Whether dropping this state at `now_millis` would be indistinguishable
    /// from the identity never having been seen.
    fn is_idle(&self, now_millis: i64) -> bool;
}

/// Registry of per-identity state records.
pub struct IdentityRegistry<S> {
    states: DashMap<String, Arc<Mutex<S>>>,
}

impl<S: IdentityState> IdentityRegistry<S> {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Run `f` on the identity's state while holding its lock.
    ///
    /// `init` builds the state the first time the identity is seen. The map
    /// shard is released before the identity lock is taken, so decisions for
    /// different identities never contend.
    pub fn with_state<I, F, R>(&self, identity: &str, init: I, f: F) -> R
    where
        I: FnOnce() -> S,
        F: FnOnce(&mut S) -> R,
    {
        let slot = self.slot(identity, init);
        let mut state = slot.lock();
        f(&mut *state)
    }

    /// Run `f` on existing state without creating any.
    pub fn peek<F, R>(&self, identity: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut S) -> R,
    {
        let slot = self.states.get(identity).map(|e| Arc::clone(e.value()))?;
        let mut state = slot.lock();
        Some(f(&mut *state))
    }

    fn slot<I>(&self, identity: &str, init: I) -> Arc<Mutex<S>>
    where
        I: FnOnce() -> S,
    {
        if let Some(existing) = self.states.get(identity) {
            return Arc::clone(existing.value());
        }

        let entry = self
            .states
            .entry(identity.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(init())));
        Arc::clone(entry.value())
    }

    /// Drop idle states that no caller currently holds.
    ///
    /// Returns the number of identities removed.
    pub fn evict_idle(&self, now_millis: i64) -> usize {
        let before = self.states.len();
        // The shard write lock held by `retain` blocks new clones of the slot,
        // so a strong count of one means nobody is mid-decision on it.
        self.states.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Some(state) => !state.is_idle(now_millis),
                None => true,
            }
        });
        before.saturating_sub(self.states.len())
    }

    /// Number of identities with live state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.states.contains_key(identity)
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.states.clear();
    }
}

impl<S: IdentityState> Default for IdentityRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
