//! Distributed admission over a shared counter store.
//!
//! Every decision is a single atomic check-and-increment against the store,
//! so any number of processes sharing the store agree on one count per
//! identity. No store state is cached locally between calls.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::backend::{RemoteCheck, RemoteCounterStore};
use super::key::Keyspace;
use super::mode::Algorithm;
use super::{REMOTE_EXPIRY_MS, WINDOW_MS};
use crate::error::{GatekeeperError, Result};

/// Default bound on one round-trip to the store.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_millis(250);

/// Admission decisions shared across processes through a remote store.
pub struct DistributedLimiter {
    /// The shared counter store.
    store: Arc<dyn RemoteCounterStore>,
    /// Key naming for identities.
    keyspace: Keyspace,
    /// Bound on each round-trip; exceeding it counts as a store failure.
    timeout: Duration,
}

impl DistributedLimiter {
    /// Create a distributed limiter with the default keyspace and timeout.
    pub fn new(store: Arc<dyn RemoteCounterStore>) -> Self {
        Self::with_options(store, Keyspace::default(), DEFAULT_REMOTE_TIMEOUT)
    }

    pub fn with_options(
        store: Arc<dyn RemoteCounterStore>,
        keyspace: Keyspace,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            keyspace,
            timeout,
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Decide admission for one request, failing closed.
    ///
    /// Any store error or timeout is logged and reported as a denial.
    pub async fn check(
        &self,
        identity: &str,
        limit: u64,
        algorithm: Algorithm,
        now_millis: i64,
    ) -> bool {
        match self.try_check(identity, limit, algorithm, now_millis).await {
            Ok(admitted) => {
                trace!(
                    identity = %identity,
                    limit = limit,
                    algorithm = %algorithm,
                    admitted = admitted,
                    "Distributed decision"
                );
                admitted
            }
            Err(e) => {
                warn!(
                    identity = %identity,
                    algorithm = %algorithm,
                    error = %e,
                    "Remote counter store failed, denying request"
                );
                false
            }
        }
    }

    /// Decide admission for one request, surfacing store failures.
    pub async fn try_check(
        &self,
        identity: &str,
        limit: u64,
        algorithm: Algorithm,
        now_millis: i64,
    ) -> Result<bool> {
        let check = RemoteCheck {
            key: self.keyspace.key_for(identity, algorithm),
            algorithm,
            limit,
            now_millis,
            window_millis: WINDOW_MS,
            expiry_millis: REMOTE_EXPIRY_MS,
            member: unique_member(),
        };

        let admitted = tokio::time::timeout(self.timeout, self.store.check_and_increment(&check))
            .await
            .map_err(|_| GatekeeperError::RemoteTimeout(self.timeout))??;

        if !admitted {
            debug!(key = %check.key, limit = limit, "Distributed rate limit exceeded");
        }
        Ok(admitted)
    }
}

/// A marker value no other admission, in any process, will produce.
fn unique_member() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    format!("{}-{}", nanos, Uuid::new_v4().simple())
}
