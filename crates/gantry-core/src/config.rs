//! Configuration types for gantry

use crate::{GantryError, GantryResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Upper bound for a single health probe, in seconds
pub const MAX_PROBE_TIMEOUT_SECS: u64 = 10;

/// Load balancer configuration, as read from a TOML file or built from flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Address to bind the listener
    pub address: String,
    /// Port to listen on
    pub port: u16,
    /// Seconds between health check passes
    pub health_check_interval_secs: u64,
    /// Backend selection strategy name
    pub strategy: String,
    /// Health probe settings
    pub health_check: HealthCheckConfig,
    /// Upstream backends, in selection order
    pub backends: Vec<BackendConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
            health_check_interval_secs: 10,
            strategy: Strategy::RoundRobin.to_string(),
            health_check: HealthCheckConfig::default(),
            backends: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BalancerConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> GantryResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GantryError::Config(format!("Failed to read config file: {}", e)))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration, reporting the first problem found
    pub fn validate(&self) -> GantryResult<()> {
        if self.port == 0 {
            return Err(GantryError::Config(format!(
                "invalid port number: {}",
                self.port
            )));
        }
        if self.health_check_interval_secs == 0 {
            return Err(GantryError::Config(
                "health check interval must be positive".to_string(),
            ));
        }
        if self.health_check.probe_timeout_secs == 0 || self.health_check.pass_timeout_secs == 0 {
            return Err(GantryError::Config(
                "health check timeouts must be positive".to_string(),
            ));
        }
        if self.health_check.probe_timeout_secs > MAX_PROBE_TIMEOUT_SECS {
            return Err(GantryError::Config(format!(
                "health check probe timeout must not exceed {} seconds",
                MAX_PROBE_TIMEOUT_SECS
            )));
        }
        if let Some(path) = &self.health_check.path {
            if !path.starts_with('/') {
                return Err(GantryError::Config(format!(
                    "health check path must start with '/': {:?}",
                    path
                )));
            }
        }
        if self.backends.is_empty() {
            return Err(GantryError::Config(
                "at least one backend is required".to_string(),
            ));
        }
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.url.is_empty() {
                return Err(GantryError::Config(format!("backend {}: URL is required", i)));
            }
            parse_backend_url(&backend.url)?;
        }
        Ok(())
    }

    /// Interval between health check passes
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Resolve the configured strategy name, warning on unknown names
    pub fn strategy(&self) -> Strategy {
        Strategy::parse(&self.strategy)
    }
}

/// Parse a backend URL.
///
/// Backends are spoken to over plain HTTP, so the scheme must be `http`.
/// Requests are joined onto the URL path, which rules out a query or fragment.
pub fn parse_backend_url(raw: &str) -> GantryResult<Url> {
    let url = Url::parse(raw).map_err(|e| GantryError::InvalidBackendUrl {
        url: raw.to_string(),
        reason: format!("failed to parse backend URL: {}", e),
    })?;
    if url.scheme().is_empty() || url.host_str().map_or(true, str::is_empty) {
        return Err(GantryError::InvalidBackendUrl {
            url: raw.to_string(),
            reason: "missing scheme or host".to_string(),
        });
    }
    if url.scheme() != "http" {
        return Err(GantryError::InvalidBackendUrl {
            url: raw.to_string(),
            reason: format!(
                "unsupported scheme {}, only http backends are supported",
                url.scheme()
            ),
        });
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(GantryError::InvalidBackendUrl {
            url: raw.to_string(),
            reason: "backend URL must not carry a query or fragment".to_string(),
        });
    }
    Ok(url)
}

/// One upstream backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Absolute URL of the backend (scheme and host)
    pub url: String,
    /// Relative weight. Accepted but not used by any strategy.
    #[serde(default)]
    pub weight: u32,
    /// Connection cap. Accepted but not enforced.
    #[serde(default)]
    pub max_conns: u32,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: 0,
            max_conns: 0,
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe by HTTP GET on this path instead of a TCP connect
    pub path: Option<String>,
    /// Ceiling for a single probe, in seconds
    pub probe_timeout_secs: u64,
    /// Budget for a whole pass over all backends, in seconds
    pub pass_timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: None,
            probe_timeout_secs: 10,
            pass_timeout_secs: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Rotate through alive backends in insertion order
    #[default]
    RoundRobin,
    /// Pick the alive backend with the fewest in-flight requests
    LeastConnected,
}

impl Strategy {
    /// Map a strategy name to a strategy.
    ///
    /// Unknown names fall back to round-robin with a warning; this never fails.
    pub fn parse(name: &str) -> Self {
        match name {
            "round-robin" => Strategy::RoundRobin,
            "least-connected" => Strategy::LeastConnected,
            other => {
                warn!(strategy = %other, "Unknown strategy, defaulting to round-robin");
                Strategy::RoundRobin
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConnected => "least-connected",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
