//! crossmatrix core
//!
//! Domain types, port traits, target resolution and configuration loading
//! shared by the runner, scheduler, reporter and CLI crates. Nothing in here
//! talks to a container engine directly.

pub mod config;
pub mod error;
pub mod ids;
pub mod job;
pub mod matrix;
pub mod policy;
pub mod ports;
pub mod report;
pub mod targets;

pub use error::{ConfigError, Error, Result};
pub use ids::*;
