//! Admission algorithm selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{info, warn};

/// The admission algorithm applied to every identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Hard bound over a rolling one-second log of admissions.
    #[default]
    Sliding,
    /// Continuous refill of a capacity-bounded token pool.
    Leaky,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sliding => "sliding",
            Algorithm::Leaky => "leaky",
        }
    }

    fn to_repr(self) -> u8 {
        match self {
            Algorithm::Sliding => 0,
            Algorithm::Leaky => 1,
        }
    }

    fn from_repr(repr: u8) -> Self {
        match repr {
            1 => Algorithm::Leaky,
            _ => Algorithm::Sliding,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a mode string names no known algorithm.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown admission algorithm '{0}'")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sliding" => Ok(Algorithm::Sliding),
            "leaky" => Ok(Algorithm::Leaky),
            other => Err(UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Instance-scoped switch between admission algorithms.
///
/// Reads and writes are single atomic operations, so the mode can change
/// while decisions are in flight; each decision sees one mode or the other.
#[derive(Debug, Default)]
pub struct ModeSelector {
    mode: AtomicU8,
}

impl ModeSelector {
    pub fn new(initial: Algorithm) -> Self {
        Self {
            mode: AtomicU8::new(initial.to_repr()),
        }
    }

    pub fn get(&self) -> Algorithm {
        Algorithm::from_repr(self.mode.load(Ordering::Acquire))
    }

    pub fn set(&self, algorithm: Algorithm) {
        self.mode.store(algorithm.to_repr(), Ordering::Release);
    }

    /// Switch by name. Unknown names leave the mode unchanged.
    ///
    /// Returns the mode in effect afterwards.
    pub fn set_mode(&self, mode: &str) -> Algorithm {
        match mode.parse::<Algorithm>() {
            Ok(algorithm) => {
                self.set(algorithm);
                info!(mode = %algorithm, "Admission algorithm switched");
            }
            Err(e) => {
                warn!(error = %e, current = %self.get(), "Ignoring mode change");
            }
        }
        self.get()
    }

    /// Name of the mode in effect.
    pub fn get_mode(&self) -> &'static str {
        self.get().as_str()
    }
}
