mod api;
mod client;
mod config;
mod forms;
mod server;
mod settings;
mod tracker;

use crate::client::{
    ClientLoader, HttpClientLoader, PipelinesConfig, RecordingLoader, RecordingTrackingClient,
};
use crate::config::AppConfig;
use crate::server::AppState;
use crate::settings::{FileSettingsBackend, SettingsStore};
use crate::tracker::Tracker;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Manual QA harness for the CDP tracking pipeline.
#[derive(Debug, Parser)]
#[command(name = "cdp-harness", version, about)]
struct Cli {
    /// Address to serve the harness API on (overrides BIND_ADDR).
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Directory holding the persisted settings record (overrides SETTINGS_DIR).
    #[arg(long)]
    settings_dir: Option<PathBuf>,
    /// Pipelines API base url (overrides CDP_API_BASE).
    #[arg(long)]
    api_base: Option<String>,
    /// Record tracking calls in-process instead of sending them.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env()?.with_overrides(
        cli.bind,
        cli.settings_dir,
        cli.api_base.as_deref(),
        cli.dry_run,
    )?;

    let store = SettingsStore::new(Arc::new(FileSettingsBackend::new(&config.settings_dir)));
    let loader: Arc<dyn ClientLoader> = if config.dry_run {
        tracing::info!("dry run: tracking calls are recorded, not sent");
        Arc::new(RecordingLoader::ready(Arc::new(
            RecordingTrackingClient::default(),
        )))
    } else {
        Arc::new(HttpClientLoader::new(PipelinesConfig {
            api_base: config.api_base.clone(),
            timeout: config.request_timeout,
        }))
    };

    let mut tracker = Tracker::new(store.clone(), loader, config.ready_timeout);
    if store.is_configured() {
        match tracker.initialize().await {
            Ok(()) => tracing::info!("tracking client initialized from stored settings"),
            Err(err) => tracing::warn!(?err, "auto-initialize failed; waiting for configuration"),
        }
    } else {
        tracing::info!(settings_dir = ?config.settings_dir, "no write key stored yet");
    }

    let addr = config.bind_addr;
    let state = AppState::new(config, tracker);
    tracing::info!(%addr, "starting cdp-harness server");
    server::run(addr, state).await?;
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
