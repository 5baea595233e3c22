//! Configuration management for Gatekeeper.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! YAML file, and `GATEKEEPER_`-prefixed environment variables using `__` to
//! separate nested keys (e.g. `GATEKEEPER_REMOTE__ADDRESS=redis:6379`).

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{Algorithm, DistributedLimiter, Keyspace, RedisCounterStore, RedisTarget};

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission limits configuration
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Shared counter store; absent means purely local decisions
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Admission limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests per second when neither the request nor an override sets one
    #[serde(default = "default_limit")]
    pub default_limit: i64,

    /// Admission algorithm name (`sliding` or `leaky`)
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Path to a JSON file of per-identity overrides
    #[serde(default)]
    pub overrides_path: Option<String>,

    /// How often idle local state is swept, in seconds
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            mode: default_mode(),
            overrides_path: None,
            eviction_interval_secs: default_eviction_interval(),
        }
    }
}

fn default_limit() -> i64 {
    5
}

fn default_mode() -> String {
    Algorithm::default().to_string()
}

fn default_eviction_interval() -> u64 {
    30
}

/// Shared counter store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// `host:port` of the Redis server
    pub address: String,

    /// Credential; empty or absent means no AUTH
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Namespace prepended to every identity key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on one round-trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("address", &self.address)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("key_prefix", &self.key_prefix)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

fn default_key_prefix() -> String {
    crate::ratelimit::DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

impl RemoteConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Build the distributed backend described by this section.
    ///
    /// Does not connect; see [`RedisCounterStore::new`].
    pub fn build_limiter(&self) -> Result<DistributedLimiter> {
        let target = RedisTarget::new(self.address.clone(), self.password.clone(), self.db);
        let store = RedisCounterStore::new(&target)?;
        Ok(DistributedLimiter::with_options(
            std::sync::Arc::new(store),
            Keyspace::new(self.key_prefix.clone()),
            self.timeout(),
        ))
    }
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }
        builder = builder.add_source(Self::environment());

        Self::finish(builder)
    }

    /// Parse configuration from a YAML string plus the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .add_source(Self::environment());

        Self::finish(builder)
    }

    fn environment() -> Environment {
        Environment::with_prefix("GATEKEEPER")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no deployment could mean.
    pub fn validate(&self) -> Result<()> {
        if self.limits.default_limit <= 0 {
            return Err(GatekeeperError::Config(format!(
                "default_limit must be positive, got {}",
                self.limits.default_limit
            )));
        }
        if let Some(remote) = &self.remote {
            if remote.address.trim().is_empty() {
                return Err(GatekeeperError::Config(
                    "remote.address must not be empty".to_string(),
                ));
            }
            if remote.timeout_ms == 0 {
                return Err(GatekeeperError::Config(
                    "remote.timeout_ms must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}
