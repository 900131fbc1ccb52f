//! cloudstore library
//!
//! Framed request/response protocol, per-user file storage and the async
//! daemon and client built on them.

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod sandbox;

/// Installs the stderr `tracing` subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
