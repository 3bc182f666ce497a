//! gantry-core: Core types for the gantry load balancer
//!
//! This crate provides the types shared by the rest of gantry:
//! - Configuration types and validation
//! - The backend selection strategy
//! - Error handling

pub mod config;
pub mod error;

pub use config::*;
pub use error::*;
