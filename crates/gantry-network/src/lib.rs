//! gantry-network: Backend pools and request dispatch
//!
//! This crate provides the moving parts of the load balancer:
//! - Backend state and HTTP forwarding
//! - Round-robin and least-connected selection
//! - Periodic health checking
//! - The HTTP listener and its lifecycle

pub mod backend;
pub mod balancer;
pub mod health;
pub mod pool;
pub mod proxy;

pub use backend::Backend;
pub use balancer::{LoadBalancer, LoadBalancerSettings, DEFAULT_SHUTDOWN_GRACE};
pub use health::{HealthCheckReport, HealthChecker, Probe};
pub use pool::ServerPool;
pub use proxy::{Forwarder, HttpForwarder};
