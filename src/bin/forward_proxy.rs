//! Forward proxy binary.
//!
//! Run with:
//! ```bash
//! forward-proxy --port 8080 --output-file trace.log
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use forward_proxy::logging::init_logging;
use forward_proxy::{run_server, Args, ProxyConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config = ProxyConfig::try_from(args).context("invalid configuration")?;

    init_logging(config.verbose);

    info!("Starting forward proxy");
    info!("  {config}");

    run_server(config).await
}
