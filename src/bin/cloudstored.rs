use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use cloudstore::cli::DaemonOpts;
use cloudstore::config::ServerConfig;
use cloudstore::logger::{AuditLogger, NoopLogger, TextLogger};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    cloudstore::init_tracing("cloudstore=info,warn");

    if opts.root.exists() && !opts.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", opts.root.display());
    }
    std::fs::create_dir_all(&opts.root)
        .with_context(|| format!("Failed to create root directory: {}", opts.root.display()))?;
    let root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;

    let config = match &opts.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    let audit: Arc<dyn AuditLogger> = match &opts.audit_log {
        Some(path) => Arc::new(
            TextLogger::new(path)
                .with_context(|| format!("Failed to open audit log: {}", path.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    let bind = opts.bind_addr();
    info!(root = %root.display(), bind = %bind, "starting cloudstore daemon");
    if opts.bind.is_unspecified() {
        warn!("listening on all interfaces; traffic is not encrypted");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.worker_threads)
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        tokio::select! {
            served = cloudstore::net_async::server::serve(&bind, &root, config, audit) => served,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("shutdown requested");
                Ok(())
            }
        }
    })
}
