use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use proplight::Config;
use proplight::Engine;
use proplight::SimulatedRegistry;
use proplight::api;
use proplight::config::LoggingConfig;
use proplight::engine::LocalEventBus;
use tokio::sync::oneshot;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "proplightd", version)]
#[command(about = "Proportional light group daemon", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(default_value = "proplight.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, diagnostics) = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load config from '{}'", cli.config.display()))?;

    init_logging(&config.logging);
    info!("proplightd {} starting", env!("CARGO_PKG_VERSION"));
    info!("Loaded config from: {}", cli.config.display());
    for diagnostic in &diagnostics {
        warn!("{}", diagnostic);
    }

    let bus = Arc::new(LocalEventBus::new());
    let registry = Arc::new(SimulatedRegistry::new(bus.clone()));
    sync_devices(&registry, &config);

    let engine = Arc::new(Engine::from_config(&config, registry.clone(), bus));
    info!("Started {} groups", config.groups.len());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let api_task = tokio::spawn(api::serve(
        config.api.listen.clone(),
        config.api.port,
        engine.clone(),
        shutdown_rx,
    ));

    wait_for_signals(&cli.config, &engine, &registry).await?;

    let _ = shutdown_tx.send(());
    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP API server failed: {}", e),
        Err(e) => error!("HTTP API task panicked: {}", e),
    }

    engine.shutdown().await;
    info!("proplightd shutdown complete");

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(logging.targets())
        .init();
}

/// Make the simulated devices match the configuration.
///
/// Devices that already exist keep their current state.
fn sync_devices(registry: &SimulatedRegistry, config: &Config) {
    for id in registry.device_ids() {
        if !config.devices.contains_key(&id) {
            info!("Removing device {}", id);
            registry.remove(&id);
        }
    }

    let existing = registry.device_ids();
    for (id, device) in &config.devices {
        if existing.contains(id) {
            registry.set_reject_commands(id, device.reject_commands);
        } else {
            info!("Adding device {}", id);
            registry.insert(device.simulated(id));
        }
    }
}

async fn reload(path: &Path, engine: &Engine, registry: &SimulatedRegistry) {
    info!("Reloading config from: {}", path.display());
    match Config::from_file(path) {
        Ok((config, diagnostics)) => {
            for diagnostic in &diagnostics {
                warn!("{}", diagnostic);
            }
            sync_devices(registry, &config);
            engine.apply_config(&config).await;
            info!("Config reloaded, {} groups", config.groups.len());
        }
        Err(e) => error!("Keeping previous config: {}", e),
    }
}

#[cfg(unix)]
async fn wait_for_signals(
    path: &Path,
    engine: &Engine,
    registry: &SimulatedRegistry,
) -> anyhow::Result<()> {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    info!("Press Ctrl+C to exit, send SIGHUP to reload");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for shutdown signal")?;
                info!("Received shutdown signal");
                return Ok(());
            }
            _ = hangup.recv() => reload(path, engine, registry).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(
    _path: &Path,
    _engine: &Engine,
    _registry: &SimulatedRegistry,
) -> anyhow::Result<()> {
    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    Ok(())
}
