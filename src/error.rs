//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limit definition contained a non-positive value
    #[error("Invalid limit {limit} for identity '{identity}': limits must be positive")]
    InvalidOverride { identity: String, limit: i64 },

    /// Malformed limit definitions
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Shared counter store errors
    #[error("Remote store error: {0}")]
    Remote(#[from] redis::RedisError),

    /// The shared counter store did not answer in time
    #[error("Remote store did not respond within {0:?}")]
    RemoteTimeout(std::time::Duration),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
