//! HTTP load balancer: request dispatch and lifecycle

use crate::backend::Backend;
use crate::health::HealthChecker;
use crate::pool::ServerPool;
use crate::proxy::HttpForwarder;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use gantry_core::{parse_backend_url, BalancerConfig, GantryError, GantryResult, Strategy};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Grace period the daemon gives in-flight requests on shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Everything needed to construct a [`LoadBalancer`]
pub struct LoadBalancerSettings {
    /// Address the listener binds in [`LoadBalancer::start`]
    pub listen_address: SocketAddr,
    /// Time between health check passes
    pub health_check_interval: Duration,
    /// Backend selection strategy
    pub strategy: Strategy,
    /// Prober used by every pass
    pub health_checker: HealthChecker,
    /// Initial backends, in selection order
    pub backends: Vec<Arc<Backend>>,
}

impl LoadBalancerSettings {
    /// Settings with no backends, a 10 second interval and TCP probing
    pub fn new(listen_address: SocketAddr, strategy: Strategy) -> Self {
        Self {
            listen_address,
            health_check_interval: Duration::from_secs(10),
            strategy,
            health_checker: HealthChecker::default(),
            backends: Vec::new(),
        }
    }

    /// Build settings from a configuration, with an HTTP forwarder per backend
    pub fn from_config(config: &BalancerConfig) -> GantryResult<Self> {
        config.validate()?;

        let ip: IpAddr = config.address.parse().map_err(|e| {
            GantryError::Config(format!("invalid listen address {}: {}", config.address, e))
        })?;

        let client: Client<HttpConnector, Body> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let backends = config
            .backends
            .iter()
            .map(|backend| {
                let url = parse_backend_url(&backend.url)?;
                let forwarder = HttpForwarder::with_client(url.clone(), client.clone());
                Ok(Arc::new(Backend::new(url, Arc::new(forwarder))))
            })
            .collect::<GantryResult<Vec<_>>>()?;

        Ok(Self {
            listen_address: SocketAddr::new(ip, config.port),
            health_check_interval: config.health_check_interval(),
            strategy: config.strategy(),
            health_checker: HealthChecker::from_config(&config.health_check),
            backends,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeState {
    Idle,
    Serving,
    Finished,
}

/// Binds a [`ServerPool`] to a listener and dispatches every request to it.
///
/// Request handling, health checking and `add_backend` share the pool
/// without a balancer-wide lock.
pub struct LoadBalancer {
    /// Backends and selection strategy
    pool: Arc<ServerPool>,
    /// Prober for periodic passes
    health_checker: Arc<HealthChecker>,
    /// Address used by `start`
    listen_address: SocketAddr,
    /// Time between health check passes
    health_check_interval: Duration,
    /// Stops accepting, stops the health loop and cancels running passes
    shutdown: CancellationToken,
    /// Abandons in-flight requests once the grace period is over
    force: CancellationToken,
    /// Serving lifecycle
    state: watch::Sender<ServeState>,
}

impl LoadBalancer {
    /// Create a new load balancer
    pub fn new(settings: LoadBalancerSettings) -> GantryResult<Self> {
        if settings.health_check_interval.is_zero() {
            return Err(GantryError::Config(
                "health check interval must be positive".to_string(),
            ));
        }

        let pool = Arc::new(ServerPool::new(settings.strategy));
        for backend in settings.backends {
            pool.add_backend(backend);
        }

        info!(
            address = %settings.listen_address,
            strategy = %settings.strategy,
            backends = pool.size(),
            interval = ?settings.health_check_interval,
            "Load balancer created"
        );

        let (state, _) = watch::channel(ServeState::Idle);

        Ok(Self {
            pool,
            health_checker: Arc::new(settings.health_checker),
            listen_address: settings.listen_address,
            health_check_interval: settings.health_check_interval,
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
            state,
        })
    }

    /// Build a load balancer straight from configuration
    pub fn from_config(config: &BalancerConfig) -> GantryResult<Self> {
        Self::new(LoadBalancerSettings::from_config(config)?)
    }

    /// Router that sends every method and path through the pool
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(self.pool.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Forward one request to the next selected backend
    pub async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        dispatch(&self.pool, req).await
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(&self) -> GantryResult<()> {
        let listener = TcpListener::bind(self.listen_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped.
    ///
    /// Also runs the periodic health checker; its first pass starts right
    /// away so backends do not wait a full interval to become selectable.
    pub async fn serve(&self, listener: TcpListener) -> GantryResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(GantryError::Stopped);
        }
        let local_address = listener.local_addr()?;

        let mut claimed = false;
        self.state.send_if_modified(|state| {
            if *state == ServeState::Idle {
                *state = ServeState::Serving;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            return Err(GantryError::AlreadyRunning);
        }
        let _finished = FinishOnDrop {
            shutdown: &self.shutdown,
            state: &self.state,
        };

        info!(
            address = %local_address,
            strategy = %self.pool.strategy(),
            backends = self.pool.size(),
            "Load balancer listening"
        );

        tokio::spawn(health_check_loop(
            self.pool.clone(),
            self.health_checker.clone(),
            self.health_check_interval,
            self.shutdown.clone(),
        ));

        let shutdown = self.shutdown.clone();
        let server = axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

        let result = tokio::select! {
            result = server.into_future() => result.map_err(|e| GantryError::Server(e.to_string())),
            _ = self.force.cancelled() => {
                warn!("Grace period expired, abandoning in-flight requests");
                Ok(())
            }
        };

        result
    }

    /// Stop accepting connections and wait up to `grace` for in-flight
    /// requests. Requests still running after that are abandoned and the
    /// timeout is reported as an error.
    pub async fn stop(&self, grace: Duration) -> GantryResult<()> {
        info!(grace = ?grace, "Stopping load balancer");
        self.shutdown.cancel();

        let mut state = self.state.subscribe();
        let drained = async {
            loop {
                let serving = *state.borrow_and_update() == ServeState::Serving;
                if !serving || state.changed().await.is_err() {
                    return;
                }
            }
        };

        if tokio::time::timeout(grace, drained).await.is_err() {
            warn!(grace = ?grace, "In-flight requests did not drain in time");
            self.force.cancel();
            return Err(GantryError::ShutdownTimeout(grace));
        }

        info!("Load balancer stopped");
        Ok(())
    }

    /// Whether `serve` is currently accepting or draining connections
    pub fn is_running(&self) -> bool {
        *self.state.borrow() == ServeState::Serving
    }

    /// Append a backend; safe while serving
    pub fn add_backend(&self, backend: Arc<Backend>) {
        info!(backend = %backend.url(), "Adding backend");
        self.pool.add_backend(backend);
    }

    /// Snapshot of all backends
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.pool.backends().to_vec()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Get the configured listen address
    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    pub fn strategy(&self) -> Strategy {
        self.pool.strategy()
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }
}

/// Moves the balancer to `Finished` however `serve` exits, including when
/// its future is dropped
struct FinishOnDrop<'a> {
    shutdown: &'a CancellationToken,
    state: &'a watch::Sender<ServeState>,
}

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.state.send_replace(ServeState::Finished);
    }
}

async fn handle_request(
    State(pool): State<Arc<ServerPool>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut req: Request<Body>,
) -> Response<Body> {
    if let Some(ConnectInfo(peer)) = connect_info {
        append_forwarded_for(req.headers_mut(), peer.ip());
    }
    dispatch(&pool, req).await
}

async fn dispatch(pool: &ServerPool, req: Request<Body>) -> Response<Body> {
    match pool.select_next() {
        Some(backend) => backend.serve(req).await,
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not available").into_response(),
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let value = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|prior| prior.to_str().ok())
    {
        Some(prior) => format!("{}, {}", prior, client),
        None => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Spawn one pass per tick until shutdown. Passes run on child tokens so
/// shutdown cancels them too; a slow pass may overlap the next one.
async fn health_check_loop(
    pool: Arc<ServerPool>,
    checker: Arc<HealthChecker>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(interval = ?interval, "Starting health checker");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Health checker stopped");
                break;
            }
            _ = ticker.tick() => {
                let pool = pool.clone();
                let checker = checker.clone();
                let pass = shutdown.child_token();
                tokio::spawn(async move {
                    checker.run(&pool, &pass).await;
                });
            }
        }
    }
}
