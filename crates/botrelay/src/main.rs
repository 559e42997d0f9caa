//! # botrelay
//!
//! Relay binary: loads settings, starts the broker and its HTTP/WebSocket
//! front end, and runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use botrelay_broker::Broker;
use botrelay_core::logging::{LogFormat, init_subscriber};
use botrelay_server::RelayServer;
use botrelay_settings::RelaySettings;
use clap::Parser;

/// WebSocket relay between chat-platform bots and message processors.
#[derive(Parser, Debug)]
#[command(name = "botrelay", version, about)]
struct Cli {
    /// Settings file (defaults to `~/.botrelay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (`trace`, `debug`, `info`, `warn`, `error`).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<RelaySettings> {
        let mut settings = match &self.config {
            Some(path) => {
                anyhow::ensure!(path.exists(), "Settings file not found: {}", path.display());
                botrelay_settings::load_settings_from_path(path)
                    .with_context(|| format!("Failed to load settings from {}", path.display()))?
            }
            None => botrelay_settings::load_settings().context("Failed to load settings")?,
        };
        self.apply(&mut settings);
        settings.validate().context("Invalid settings after CLI overrides")?;
        Ok(settings)
    }

    /// CLI flags win over file and environment.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);

    let broker = Broker::from_settings(&settings).context("Failed to build routing rules")?;
    let metrics = botrelay_server::metrics::install_recorder();
    let server = RelayServer::new(settings.server.clone(), broker, metrics);

    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "botrelay listening on ws://{addr} (adapters: {}, processors: {}, {} routing rules)",
        settings.server.adapter_path,
        settings.server.processor_path,
        settings.routing.rules.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let timeout = Duration::from_secs(settings.server.shutdown_timeout_secs);
    let report = server.shutdown().drain(timeout).await;

    tracing::info!(drained = report.drained, "Shutdown complete");
    Ok(())
}
