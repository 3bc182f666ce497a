//! Error types for gantry

use std::time::Duration;
use thiserror::Error;

/// Main error type for gantry
#[derive(Error, Debug)]
pub enum GantryError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A backend URL could not be used as an upstream
    #[error("Invalid backend URL {url}: {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    /// Server error
    #[error("Server error: {0}")]
    Server(String),

    /// The load balancer is already serving
    #[error("Load balancer is already running")]
    AlreadyRunning,

    /// The load balancer has been stopped and cannot serve again
    #[error("Load balancer has been stopped")]
    Stopped,

    /// In-flight requests did not drain within the grace period
    #[error("Shutdown timed out after {0:?} with requests still in flight")]
    ShutdownTimeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gantry operations
pub type GantryResult<T> = Result<T, GantryError>;

impl From<toml::de::Error> for GantryError {
    fn from(err: toml::de::Error) -> Self {
        GantryError::Config(format!("Failed to parse config file: {}", err))
    }
}
