//! edge-uplink daemon
//!
//! Reads its configuration from the environment (and an optional `.env`),
//! then delivers artifacts until SIGTERM/SIGINT or a fatal store failure.

use edge_uplink::{Config, Uplink, run_with_shutdown};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("UPLINK_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "edge-uplink stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> edge_uplink::Result<()> {
    let config = Config::from_env()?;
    config.validate_for_daemon()?;

    tracing::info!(
        endpoint = ?config.upload.endpoint.as_ref().map(|u| u.as_str()),
        store = %config.persistence.store_dir.display(),
        max_concurrent = config.upload.max_concurrent_uploads,
        "Starting edge-uplink"
    );

    let uplink = Uplink::new(config).await?;
    uplink.start().await?;

    run_with_shutdown(uplink).await
}
