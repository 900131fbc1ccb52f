use anyhow::{Context, Result};
use clap::Parser;

use cloudstore::cli::ClientOpts;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    cloudstore::init_tracing("warn");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(cloudstore::net_async::client::run(&opts))
}
