// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! registry-relay: forwards registry change notifications to a local sink.
//!
//! ## Configuration
//! - `--config`: YAML file (see `RelayConfig`)
//! - `--initial-population`: replay the full registry export first
//! - `RUST_LOG`: log filter (default `info`)

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use registry_relay::{
    BrokerCheckpointStore, CheckpointBackend, CheckpointStore, ConsumerSettings, EventDispatcher,
    HttpEntityLookup, InitialPopulation, InitialPopulationJob, LoggingSink, MemoryCheckpointStore,
    NdjsonExport, RedisStreamBroker, RelayConfig, RelayError, SqliteCheckpointStore, StreamConsumer,
};

#[derive(Parser)]
#[command(name = "registry-relay")]
#[command(version, about = "Relay registry change notifications to a local system", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "relay.yaml")]
    config: PathBuf,

    /// Replay every registry entity before following the stream
    #[arg(long)]
    initial_population: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match RelayConfig::from_yaml_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
            process::exit(2);
        }
    };

    if let Err(e) = run(config, cli.initial_population).await {
        error!(error = %e, "registry-relay failed");
        process::exit(1);
    }
}

async fn run(config: RelayConfig, initial_population: bool) -> registry_relay::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!(error = %e, "Could not listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    match config.checkpoint.backend {
        CheckpointBackend::Sqlite => {
            let store = SqliteCheckpointStore::new(&config.checkpoint.sqlite_path).await?;
            let store = Arc::new(store);
            relay(&config, Arc::clone(&store), initial_population, shutdown_rx).await?;
            store.close().await;
        }
        CheckpointBackend::Broker => {
            let store = BrokerCheckpointStore::connect(&config.broker).await?;
            relay(&config, Arc::new(store), initial_population, shutdown_rx).await?;
        }
        CheckpointBackend::Memory => {
            warn!("Using in-memory checkpoints, offsets are lost on restart");
            relay(&config, Arc::new(MemoryCheckpointStore::new()), initial_population, shutdown_rx).await?;
        }
    }

    info!("registry-relay stopped");
    Ok(())
}

async fn relay<C: CheckpointStore>(
    config: &RelayConfig,
    checkpoints: Arc<C>,
    initial_population: bool,
    shutdown: watch::Receiver<bool>,
) -> registry_relay::Result<()> {
    let broker = Arc::new(RedisStreamBroker::new(config.broker.clone())?);
    let lookup = HttpEntityLookup::new(&config.lookup).map_err(|e| RelayError::Config(e.to_string()))?;
    let sink = Arc::new(LoggingSink);
    let dispatcher = Arc::new(EventDispatcher::from_config(
        Arc::new(lookup),
        Arc::clone(&sink),
        &config.dispatcher,
    ));

    let population = if initial_population {
        InitialPopulation::started_now()
    } else {
        InitialPopulation::disabled()
    };

    let consumer = StreamConsumer::new(broker, checkpoints, dispatcher, ConsumerSettings::from_config(config))
        .with_initial_population(population);

    let population_task = if population.in_progress() {
        let export = NdjsonExport::new(&config.initial_population)?
            .with_basic_auth(config.lookup.username.clone(), config.lookup.password.clone());
        let job = InitialPopulationJob::new(Arc::new(export), Arc::clone(&sink));
        let job_shutdown = shutdown.clone();
        Some(tokio::spawn(async move { job.run(job_shutdown).await }))
    } else {
        None
    };

    info!(
        stream = %config.broker.stream,
        reference = %config.broker.reference,
        initial_population,
        "Starting registry-relay"
    );
    consumer.run(shutdown).await;

    if let Some(task) = population_task {
        match task.await {
            Ok(Ok(summary)) => info!(
                forwarded = summary.forwarded,
                failed = summary.failed,
                cancelled = summary.cancelled,
                "Initial population finished"
            ),
            Ok(Err(e)) => error!(error = %e, "Initial population failed"),
            Err(e) => error!(error = %e, "Initial population task panicked"),
        }
    }
    Ok(())
}
