//! Upstream backend state

use crate::proxy::{Forwarder, HttpForwarder};
use axum::body::Body;
use axum::http::{Request, Response};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// One upstream server requests can be forwarded to.
///
/// Liveness and the in-flight connection count are independent atomics, so
/// selection, dispatch and health checking can all touch a backend without
/// a shared lock. A new backend is not alive until something marks it so.
pub struct Backend {
    /// Upstream identity
    url: Url,
    /// Last liveness written by the health checker
    alive: AtomicBool,
    /// Requests currently being forwarded
    active_connections: AtomicUsize,
    /// Forwarding capability bound to `url`
    forwarder: Arc<dyn Forwarder>,
}

impl Backend {
    /// Create a backend with an explicit forwarder
    pub fn new(url: Url, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            url,
            alive: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            forwarder,
        }
    }

    /// Create a backend that reverse proxies over HTTP to `url`
    pub fn http(url: Url) -> Self {
        let forwarder = Arc::new(HttpForwarder::new(url.clone()));
        Self::new(url, forwarder)
    }

    /// Get the backend URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` to dial, falling back to the scheme's default port
    pub fn address(&self) -> Option<String> {
        let host = self.url.host_str()?;
        let port = self.url.port_or_known_default()?;
        Some(format!("{}:{}", host, port))
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Snapshot of the number of requests being forwarded right now
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Forward a request through this backend.
    ///
    /// The connection count is held for the whole forward and released on
    /// every exit path, including a panicking forwarder or a caller that
    /// drops this future. The forwarder's response is returned untouched and
    /// liveness is never changed here.
    pub async fn serve(&self, req: Request<Body>) -> Response<Body> {
        let _guard = self.track_connection();
        self.forwarder.forward(req).await
    }

    pub(crate) fn track_connection(&self) -> ConnectionGuard<'_> {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard { backend: self }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.url.as_str())
            .field("alive", &self.is_alive())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

/// Counts one in-flight request until dropped
pub(crate) struct ConnectionGuard<'a> {
    backend: &'a Backend,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.backend
            .active_connections
            .fetch_sub(1, Ordering::AcqRel);
    }
}
