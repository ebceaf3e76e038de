//! proxy-health
//!
//! Health-check and selection-state engine for the proxy groups of a
//! mihomo / Clash core, driven through its external controller.
//!
//! # Architecture Overview
//!
//! ```text
//!     ┌───────────────────────────────────────────────────────────────┐
//!     │                          ENGINE                                │
//!     │                                                                │
//!     │   EngineHandle ──Intent──▶ coordinator ──▶ scheduler           │
//!     │                               │              │                 │
//!     │                               ▼              ▼                 │
//!     │                         topology store ◀── delay cache         │
//!     │                               │                                │
//!     │                               ▼                                │
//!     │                        state synchronizer ──▶ StateEvent stream│
//!     │                                                                │
//!     │   resolver ── follows `now` through nested groups              │
//!     └───────────────────────────────┬───────────────────────────────┘
//!                                     │ ProxyRuntime
//!                                     ▼
//!                        mihomo external controller (HTTP)
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use proxy_health::config::loader::load_config;
use proxy_health::config::watcher::ConfigWatcher;
use proxy_health::config::{self, ConfigOverrides, EngineConfig, ProbeStrategy};
use proxy_health::lifecycle::signals::wait_for_signal;
use proxy_health::observability::{logging, metrics};
use proxy_health::runtime::{ClashApiRuntime, ProxyRuntime};
use proxy_health::scheduler::TestRequest;
use proxy_health::state::StateEvent;
use proxy_health::{Engine, Shutdown};

#[derive(Parser)]
#[command(name = "proxy-health")]
#[command(about = "Health checks and selection state for proxy groups", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// External controller URL (overrides the config file)
    #[arg(long)]
    controller: Option<String>,

    /// External controller secret (overrides the config file)
    #[arg(long)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted, logging state changes
    Run,
    /// Run one test session for a group and print its delays
    Test {
        group: String,
        /// Probe every member individually instead of one group trigger
        #[arg(long)]
        per_proxy: bool,
    },
    /// Print the endpoint a group currently routes through
    Resolve { group: Option<String> },
    /// Validate the configuration file
    CheckConfig,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            controller_url: self.controller.clone(),
            secret: self.secret.clone(),
            sort_by_delay: None,
        }
    }

    /// The configuration file as written, before command-line overrides.
    fn file_config(&self) -> Result<EngineConfig, Box<dyn std::error::Error>> {
        Ok(match &self.config {
            Some(path) => load_config(path)?,
            None => EngineConfig::default(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::CheckConfig = cli.command {
        let Some(path) = &cli.config else {
            return Err("check-config needs --config <PATH>".into());
        };
        let config = load_config(path)?;
        println!("{} is valid", path.display());
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let file_config = cli.file_config()?;
    let overrides = cli.overrides();
    let mut config = overrides.applied_to(&file_config);
    logging::init_logging(&config.observability.log_level);
    if let Commands::Test { per_proxy: true, .. } = cli.command {
        config.scheduler.strategy = ProbeStrategy::PerProxy;
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        controller = %config.runtime.controller_url,
        strategy = ?config.scheduler.strategy,
        "proxy-health v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let runtime: Arc<dyn ProxyRuntime> = Arc::new(ClashApiRuntime::new(&config.runtime)?);
    let engine = Engine::with_overrides(runtime, config::shared(config), overrides);

    match cli.command {
        Commands::Run => run(engine, cli.config.map(|path| (path, file_config))).await,
        Commands::Test { group, .. } => test_group(engine, &group).await,
        Commands::Resolve { group } => resolve(engine, group).await,
        Commands::CheckConfig => Ok(()),
    }
}

async fn run(
    engine: Arc<Engine>,
    watched: Option<(PathBuf, EngineConfig)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Shutdown::new();

    // The notify watcher stops when dropped, so keep it for the whole run.
    let mut _watcher = None;
    let updates = match watched {
        Some((path, current)) => {
            let (watcher, updates) = ConfigWatcher::new(&path, current);
            _watcher = Some(watcher.run()?);
            Some(updates)
        }
        None => None,
    };

    let loaded = engine.prefetch().await;
    tracing::info!(groups = engine.store().len(), loaded, "Initial topology loaded");

    let (handle, coordinator) = engine.spawn(&shutdown, updates);
    handle.reload_all().await?;

    let mut events = engine.subscribe();
    let mut stop = shutdown.subscribe();
    let printer_engine = Arc::clone(&engine);
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(StateEvent::GroupUpdated { index, revision }) => {
                        if let Some(state) = printer_engine.snapshot(index) {
                            tracing::info!(
                                index,
                                revision,
                                group = %state.name,
                                now = ?state.now,
                                testing = state.testing,
                                "Group updated"
                            );
                        }
                    }
                    Ok(event) => tracing::info!(event = ?event, "State event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "State event stream lagged");
                    }
                    Err(_) => break,
                },
                _ = stop.recv() => break,
            }
        }
    });

    wait_for_signal().await;
    shutdown.trigger();
    let _ = coordinator.await;
    let _ = printer.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn test_group(engine: Arc<Engine>, group: &str) -> Result<(), Box<dyn std::error::Error>> {
    engine.prefetch().await;
    let index = engine
        .store()
        .index_of(group)
        .ok_or_else(|| format!("unknown group '{group}'"))?;

    let mut events = engine.subscribe();
    match engine.scheduler().request_test(index) {
        TestRequest::Started { .. } | TestRequest::Coalesced { .. } => {}
        other => return Err(format!("test not started: {other:?}").into()),
    }

    while engine.scheduler().is_testing(index) {
        if let Err(tokio::sync::broadcast::error::RecvError::Closed) = events.recv().await {
            break;
        }
    }

    let state = engine
        .snapshot(index)
        .ok_or_else(|| format!("group '{group}' vanished during the test"))?;
    println!("{}", serde_json::to_string_pretty(&state.links)?);
    Ok(())
}

async fn resolve(engine: Arc<Engine>, group: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = match group {
        Some(group) => engine.resolve_endpoint(&group).await,
        None => {
            engine.prefetch().await;
            engine.current_endpoint().await
        }
    };
    match endpoint {
        Some(endpoint) => {
            println!("{}", serde_json::to_string_pretty(&endpoint)?);
            Ok(())
        }
        None => Err("no endpoint could be resolved".into()),
    }
}
