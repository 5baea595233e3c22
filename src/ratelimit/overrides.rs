//! Per-identity limit overrides.
//!
//! Overrides replace the caller-supplied default limit for one identity. They
//! can be set at runtime or bulk-loaded from a flat JSON definition such as
//! `{"alice": 5, "bob": 10}`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{GatekeeperError, Result};

/// Identity → requests-per-second overrides.
///
/// Read far more often than written; writers take a short exclusive lock and
/// the last write for an identity wins.
#[derive(Debug, Default)]
pub struct LimitOverrides {
    limits: RwLock<HashMap<String, u64>>,
}

impl LimitOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an override for `identity`, replacing any previous one.
    pub fn set_override(&self, identity: &str, limit: u64) {
        debug!(identity = %identity, limit = limit, "Setting limit override");
        self.limits.write().insert(identity.to_string(), limit);
    }

    /// The override for `identity`, if one is configured.
    pub fn get_override(&self, identity: &str) -> Option<u64> {
        self.limits.read().get(identity).copied()
    }

    /// Remove the override for `identity`, returning it.
    pub fn remove(&self, identity: &str) -> Option<u64> {
        self.limits.write().remove(identity)
    }

    /// Load overrides from a JSON file.
    ///
    /// The whole file is parsed and validated before any entry is applied, so
    /// an unreadable or malformed file leaves existing overrides untouched.
    pub fn load_from_definition<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit overrides");

        let contents = std::fs::read_to_string(path)?;
        self.load_from_str(&contents)
    }

    /// Load overrides from a JSON document held in memory.
    pub fn load_from_str(&self, json: &str) -> Result<usize> {
        let parsed = parse_definition(json)?;
        let count = parsed.len();

        let mut limits = self.limits.write();
        for (identity, limit) in parsed {
            limits.insert(identity, limit);
        }
        drop(limits);

        info!(count = count, "Applied limit overrides");
        Ok(count)
    }

    /// Number of configured overrides.
    pub fn len(&self) -> usize {
        self.limits.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.read().is_empty()
    }
}

fn parse_definition(json: &str) -> Result<Vec<(String, u64)>> {
    let raw: HashMap<String, i64> = serde_json::from_str(json)?;

    raw.into_iter()
        .map(|(identity, limit)| match u64::try_from(limit) {
            Ok(limit) if limit > 0 => Ok((identity, limit)),
            _ => Err(GatekeeperError::InvalidOverride { identity, limit }),
        })
        .collect()
}
