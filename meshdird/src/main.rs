mod command;
mod config;
mod control;
mod directory;
mod discovery;
mod registry;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::command::CommandTable;
use crate::config::Config;
use crate::control::DirectoryHandle;
use crate::directory::Directory;
use crate::discovery::mdns::MdnsFactory;
use crate::discovery::DiscoverySync;
use crate::registry::signer::KeyringSigner;
use crate::registry::{RecordDefaults, ServiceRegistry};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshdird=info"))
        )
        .init();

    tracing::info!("Starting meshdird");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/meshdird/meshdird.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let commands = CommandTable::standard().context("Failed to build command table")?;
    let registry = ServiceRegistry::new(
        Box::new(KeyringSigner::new()),
        RecordDefaults::from(&config.registry),
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let factory = MdnsFactory::new(&config.discovery)?;
    let sync = DiscoverySync::start(Box::new(factory), events_tx)?;

    let directory = Directory::new(registry, commands, sync, config.dump.path.clone());

    let listener = control::bind(&config.control.socket_path)?;

    let cancel = CancellationToken::new();

    let (handle, requests) = DirectoryHandle::channel(64);
    let listener_handle = tokio::spawn(control::run(listener, handle, cancel.clone()));

    // SIGINT and SIGTERM both end the loop
    let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                }
            }
            _ = terminate.recv() => {}
        }
        tracing::info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    let result = directory::serve(
        directory,
        requests,
        events_rx,
        config.registry.sweep_interval(),
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    let _ = listener_handle.await;

    if let Err(e) = std::fs::remove_file(&config.control.socket_path) {
        tracing::warn!("Failed to remove control socket: {}", e);
    }

    tracing::info!("Shutdown complete");
    result
}
