//! Remote key generation for identities.

use super::mode::Algorithm;

/// Default namespace for remote counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate:";

/// Derives namespaced remote keys from identities.
///
/// Sliding-window keys are `<prefix><identity>`; leaky-bucket keys live under
/// `<prefix>leaky:<identity>` so the two representations never share a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The remote key holding `identity`'s state for `algorithm`.
    pub fn key_for(&self, identity: &str, algorithm: Algorithm) -> String {
        match algorithm {
            Algorithm::Sliding => format!("{}{}", self.prefix, identity),
            Algorithm::Leaky => format!("{}leaky:{}", self.prefix, identity),
        }
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
