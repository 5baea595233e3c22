//! Rate limiting logic and state management.

mod backend;
mod clock;
mod distributed;
mod key;
mod leaky;
mod limiter;
mod mode;
mod overrides;
mod redis_store;
mod registry;
mod sliding;

pub use backend::{MemoryCounterStore, RemoteCheck, RemoteCounterStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{DistributedLimiter, DEFAULT_REMOTE_TIMEOUT};
pub use key::{Keyspace, DEFAULT_KEY_PREFIX};
pub use leaky::{LeakyBucket, LocalLeakyTracker};
pub use limiter::RateLimiter;
pub use mode::{Algorithm, ModeSelector, UnknownAlgorithm};
pub use overrides::LimitOverrides;
pub use redis_store::{RedisCounterStore, RedisTarget};
pub use registry::{IdentityRegistry, IdentityState};
pub use sliding::{LocalSlidingTracker, SlidingWindowLog};

/// Length of the rolling admission window in milliseconds.
pub const WINDOW_MS: i64 = 1000;

/// Expiry refreshed on remote keys at every admission.
pub const REMOTE_EXPIRY_MS: i64 = 2 * WINDOW_MS;
