//! # rtsp-relay
//!
//! Relay server binary: loads config, initializes telemetry and serves
//! camera streams to WebSocket clients until SIGTERM or Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::{FfmpegTranscoder, LoadedConfig, RelayConfig};
use relay_telemetry::LogFormat;

/// RTSP to WebSocket frame relay.
#[derive(Parser, Debug)]
#[command(name = "rtsp-relay", about = "Relay RTSP camera streams to WebSocket clients as JPEG frames")]
struct Cli {
    /// JSON config file, merged over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config and environment).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config and environment).
    #[arg(long)]
    port: Option<u16>,

    /// Log output format: json or pretty.
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }

    /// Apply the flags over the loaded config and validate the result.
    fn resolve(&self, loaded: LoadedConfig) -> Result<RelayConfig> {
        let mut config = loaded.config;
        self.apply(&mut config);
        config.validate().context("Invalid config")?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = relay_server::load_config(cli.config.as_deref()).context("Failed to load config")?;
    let rejected_env = loaded.rejected_env.clone();
    let config = cli.resolve(loaded)?;

    let telemetry = relay_telemetry::init_telemetry(config.telemetry_config());
    if let Some(path) = &cli.config {
        tracing::debug!(?path, "Loaded config file");
    }
    for rejected in &rejected_env {
        tracing::warn!(key = %rejected.key, value = %rejected.value, "Invalid env var, ignoring");
    }

    let transcoder = Arc::new(FfmpegTranscoder::new(config.transcode.clone()));
    let handle = relay_server::start(&config, transcoder, telemetry.metrics())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;

    tracing::info!(
        port = handle.port,
        health = %format!("http://localhost:{}/health", handle.port),
        test_ffmpeg = %format!("http://localhost:{}/test-ffmpeg", handle.port),
        "Relay ready, waiting for connections"
    );

    wait_for_signal().await?;
    tracing::info!("Shutdown signal received, terminating streams");
    handle.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl+c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")
}
