//! Concord daemon library
//!
//! Wires the engine into a long-running process:
//! - change-feed consumer for the reactive path
//! - sweep scheduler
//! - agent runner pool backed by the configured oracle
//! - REST surface and graceful shutdown

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod config;
pub mod error;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, ApiResult, DaemonError, DaemonResult};
pub use server::Server;
