//! # storesync
//!
//! Sync server binary: loads settings, starts the HTTP/WebSocket server and
//! runs until Ctrl-C.

#![deny(unsafe_code)]

mod telemetry;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use storesync_server::server::SyncServer;
use storesync_settings::SyncSettings;

/// Real-time store data synchronization server.
#[derive(Parser, Debug)]
#[command(name = "storesync", about = "Real-time store data synchronization server")]
struct Cli {
    /// Settings file (defaults to `~/.storesync/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter directive (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Load settings and layer the command-line overrides on top.
    fn resolve_settings(&self) -> Result<SyncSettings> {
        let mut settings = match &self.config {
            Some(path) => storesync_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => storesync_settings::load_settings().with_context(|| {
                format!(
                    "Failed to load settings from {}",
                    storesync_settings::settings_path().display()
                )
            })?,
        };

        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.resolve_settings()?;
    telemetry::init(&settings.logging);

    let metrics = storesync_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = SyncServer::from_settings(&settings)
        .context("Invalid settings")?
        .with_metrics(metrics);

    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "storesync listening on http://{addr} (websocket path {})",
        settings.server.ws_path
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
