//! Health checking for backends

use crate::backend::Backend;
use crate::pool::ServerPool;
use gantry_core::HealthCheckConfig;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Ceiling for a single probe and for a whole pass
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a backend's reachability is probed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Open a TCP connection to the backend's host and port
    Tcp,
    /// GET `path` on the backend and expect a 2xx status
    Http { path: String },
}

/// Outcome of one pass over the pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckReport {
    /// Backends in the snapshot taken at the start of the pass
    pub total: usize,
    /// Backends whose liveness was written
    pub checked: usize,
    /// Backends found alive
    pub healthy: usize,
    /// The pass stopped early on cancellation or its deadline
    pub cancelled: bool,
}

/// Probes backends one at a time and records their liveness
pub struct HealthChecker {
    /// Probe kind
    probe: Probe,
    /// HTTP client for `Probe::Http`
    client: reqwest::Client,
    /// Ceiling for a single probe
    probe_timeout: Duration,
    /// Budget for a whole pass
    pass_timeout: Duration,
}

impl HealthChecker {
    /// Create a new health checker. The probe timeout is capped at
    /// [`DEFAULT_PROBE_TIMEOUT`].
    pub fn new(probe: Probe, probe_timeout: Duration, pass_timeout: Duration) -> Self {
        Self {
            probe,
            client: reqwest::Client::new(),
            probe_timeout: probe_timeout.min(DEFAULT_PROBE_TIMEOUT),
            pass_timeout,
        }
    }

    pub fn from_config(config: &HealthCheckConfig) -> Self {
        let probe = match &config.path {
            Some(path) => Probe::Http { path: path.clone() },
            None => Probe::Tcp,
        };
        Self::new(
            probe,
            Duration::from_secs(config.probe_timeout_secs),
            Duration::from_secs(config.pass_timeout_secs),
        )
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    /// Get the per-probe timeout
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Probe one backend within `timeout`
    pub async fn check(&self, backend: &Backend, timeout: Duration) -> bool {
        match &self.probe {
            Probe::Tcp => match backend.address() {
                Some(address) => is_backend_alive(&address, timeout).await,
                None => false,
            },
            Probe::Http { path } => {
                let url = format!(
                    "{}{}",
                    backend.url().as_str().trim_end_matches('/'),
                    path
                );
                is_http_backend_healthy(&self.client, &url, timeout).await
            }
        }
    }

    /// Run one pass over the pool.
    ///
    /// The backend list is snapshotted once, so backends added during the
    /// pass wait for the next one. Each probe is bounded by the smaller of
    /// the probe timeout and what is left of the pass budget. Cancellation
    /// or the pass deadline ends the pass at once and leaves the remaining
    /// backends untouched.
    pub async fn run(&self, pool: &ServerPool, cancel: &CancellationToken) -> HealthCheckReport {
        let backends = pool.backends();
        let deadline = Instant::now() + self.pass_timeout;
        let mut report = HealthCheckReport {
            total: backends.len(),
            ..HealthCheckReport::default()
        };

        debug!(backends = backends.len(), "Starting health check pass");

        for backend in backends.iter() {
            let timeout = self
                .probe_timeout
                .min(deadline.saturating_duration_since(Instant::now()));

            let alive = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Gracefully shutting down health check");
                    report.cancelled = true;
                    return report;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    info!(
                        checked = report.checked,
                        total = report.total,
                        "Health check pass ran out of time"
                    );
                    report.cancelled = true;
                    return report;
                }
                alive = self.check(backend, timeout) => alive,
            };

            backend.set_alive(alive);
            report.checked += 1;
            if alive {
                report.healthy += 1;
            }

            let status = if alive { "up" } else { "down" };
            debug!(backend = %backend.url(), status = status, "Backend status");
        }

        report
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(Probe::Tcp, DEFAULT_PROBE_TIMEOUT, DEFAULT_PROBE_TIMEOUT)
    }
}

/// Whether a TCP connection to `address` opens within `timeout`
pub async fn is_backend_alive(address: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(address = %address, error = %e, "Site unreachable");
            false
        }
        Err(_) => {
            debug!(address = %address, "Health probe timed out");
            false
        }
    }
}

/// Whether a GET of `url` answers with a 2xx status within `timeout`
pub async fn is_http_backend_healthy(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) => {
            let healthy = response.status().is_success();
            if !healthy {
                debug!(endpoint = %url, status = %response.status(), "Health check failed");
            }
            healthy
        }
        Err(e) => {
            debug!(endpoint = %url, error = %e, "Health check error");
            false
        }
    }
}
