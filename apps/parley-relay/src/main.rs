use anyhow::{Context, Result};
use clap::Parser;
use parley_relay::{config::Cli, telemetry::Telemetry, RelayConfig, RelayState};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init(config.otel_stdout)?;

    info!(
        listen_addr = %config.listen_addr,
        handshake_timeout_ms = config.handshake_timeout.as_millis() as u64,
        "starting parley relay"
    );

    let state = RelayState::new(config.clone(), Some(telemetry.metrics_handle()));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("parley relay listening on {}", config.listen_addr);

    parley_relay::serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
