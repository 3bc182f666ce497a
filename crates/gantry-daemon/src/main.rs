//! gantry daemon
//!
//! Runs the load balancer until it is told to shut down.

use anyhow::Context;
use clap::Parser;
use gantry_core::{
    parse_backend_url, BackendConfig, BalancerConfig, GantryError, GantryResult,
    HealthCheckConfig, LoggingConfig,
};
use gantry_network::{LoadBalancer, DEFAULT_SHUTDOWN_GRACE};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// gantryd - HTTP load balancer with health-checked backends
#[derive(Parser, Debug)]
#[command(name = "gantryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file (takes precedence over the flags below)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the listener
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Seconds between health checks
    #[arg(long, default_value_t = 10)]
    health_check_interval: u64,

    /// Load balancing strategy (round-robin or least-connected)
    #[arg(long, default_value = "round-robin")]
    strategy: String,

    /// Probe backends with an HTTP GET on this path instead of a TCP connect
    #[arg(long)]
    health_path: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Backend URLs
    backends: Vec<String>,
}

/// Build a validated configuration from the file or the flags
fn config_from_args(args: &Args) -> GantryResult<BalancerConfig> {
    if let Some(path) = &args.config {
        return BalancerConfig::from_file(path);
    }

    if args.backends.is_empty() {
        return Err(GantryError::Config(
            "please provide at least one backend URL".to_string(),
        ));
    }
    for url in &args.backends {
        parse_backend_url(url)?;
    }

    let config = BalancerConfig {
        address: args.address.clone(),
        port: args.port,
        health_check_interval_secs: args.health_check_interval,
        strategy: args.strategy.clone(),
        health_check: HealthCheckConfig {
            path: args.health_path.clone(),
            ..HealthCheckConfig::default()
        },
        backends: args.backends.iter().map(BackendConfig::new).collect(),
        logging: LoggingConfig {
            level: args.log_level.clone().unwrap_or_else(|| "info".to_string()),
        },
    };
    config.validate()?;
    Ok(config)
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Resolve on Ctrl-C or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, initiating shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = config_from_args(&args).context("Failed to create load balancer")?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    info!("Starting gantry v{}", env!("CARGO_PKG_VERSION"));

    let lb = Arc::new(LoadBalancer::from_config(&config)?);

    let mut server = {
        let lb = lb.clone();
        tokio::spawn(async move { lb.start().await })
    };

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    lb.stop(DEFAULT_SHUTDOWN_GRACE)
        .await
        .context("Error during shutdown")?;
    server.await??;

    info!("gantry stopped");
    Ok(())
}
