//! Ingest command implementation.

use crate::server::{start_server, ServerState};
use anyhow::{Context, Result};
use q2kv_core::engine::{BatchSink, SinkRunner};
use q2kv_core::health::HealthCheck;
use q2kv_core::metrics::SinkCounter;
use q2kv_core::source::MemoryChannel;
use q2kv_core::store::MemoryStore;
use q2kv_core::{Authorizations, Config, EventRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Instance name used when the config names none.
const DEFAULT_INSTANCE: &str = "q2kv";

/// Options for an ingest run.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// JSON lines event file
    pub input: PathBuf,
    /// Target table override
    pub table: Option<String>,
    /// Batch size override
    pub batch_size: Option<usize>,
    /// Print stored cells after the run
    pub dump: bool,
    /// Authorizations used for the dump scan
    pub auths: Vec<String>,
}

/// Drain an event file into an in-process store.
pub async fn run(mut config: Config, options: IngestOptions) -> Result<()> {
    if let Some(table) = options.table {
        config.sink.table = table;
    }
    if let Some(batch_size) = options.batch_size {
        config.sink.batch_size = batch_size;
    }
    config.validate()?;

    let events = read_events(&options.input)?;
    let channel = MemoryChannel::new("ingest", events.len().max(1));
    channel.put_all(events)?;

    info!(
        input = %options.input.display(),
        events = channel.len(),
        table = %config.sink.table,
        batch_size = config.sink.batch_size,
        "Starting ingest"
    );

    let store = prepare_store(&config)?;
    let user = config.store.user.clone().unwrap_or_else(|| "root".to_string());
    let password = config.store.password.clone().unwrap_or_default();
    let connector = store.connector(&user, &password)?;

    let counter = Arc::new(SinkCounter::new());
    let health = Arc::new(HealthCheck::for_sink());

    let mut sink = BatchSink::new("ingest", Arc::new(channel.clone()))
        .with_connector(Arc::new(connector))
        .with_counter(Arc::clone(&counter));
    sink.configure(&config)?;
    sink.start().await?;

    let mut runner = SinkRunner::new(sink)
        .with_health(Arc::clone(&health))
        .exit_when_drained(true);
    let shutdown_tx = runner.shutdown_signal();

    let server_state = Arc::new(ServerState {
        health: Arc::clone(&health),
        counter: Arc::clone(&counter),
    });
    let server_shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(start_server(
        server_state,
        config.monitoring.health_port,
        config.monitoring.metrics_port,
        server_shutdown_rx,
    ));

    tokio::spawn(forward_signals(shutdown_tx.clone()));

    let result = runner.run().await;
    let _ = shutdown_tx.send(());

    info!(
        committed = channel.committed_count(),
        remaining = channel.len(),
        batches = counter.batch_complete_count() + counter.batch_underflow_count(),
        rollbacks = counter.rollback_count(),
        "Ingest finished"
    );
    result?;

    if options.dump {
        dump_table(&store, &config.sink.table, &options.auths)?;
    }
    Ok(())
}

/// Parse one event per non-blank line.
fn read_events(path: &Path) -> Result<Vec<EventRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            EventRecord::from_json(line)
                .with_context(|| format!("{}:{}: invalid event", path.display(), n + 1))
        })
        .collect()
}

/// Register the configured instance and make sure its user and table exist.
fn prepare_store(config: &Config) -> Result<Arc<MemoryStore>> {
    let instance = config.store.instance.as_deref().unwrap_or(DEFAULT_INSTANCE);
    let store = MemoryStore::register(instance);

    if let Some(user) = &config.store.user {
        store.create_user(user.clone(), config.store.password.clone().unwrap_or_default());
    }
    if !store.table_exists(&config.sink.table) {
        store.create_table(&config.sink.table)?;
    }
    Ok(store)
}

/// Print the cells of a table visible with the given authorizations.
fn dump_table(store: &MemoryStore, table: &str, auths: &[String]) -> Result<()> {
    let cells = store.scan(table, &Authorizations::new(auths))?;
    let hidden = store.cell_count(table)? - cells.len();

    for (key, cell) in &cells {
        println!(
            "{} {}:{} [{}] {}",
            String::from_utf8_lossy(&key.row),
            String::from_utf8_lossy(&key.family),
            String::from_utf8_lossy(&key.qualifier),
            cell.visibility,
            String::from_utf8_lossy(&cell.value),
        );
    }
    if hidden > 0 {
        println!("({hidden} cell(s) hidden by visibility)");
    }
    Ok(())
}

/// Turn SIGINT/SIGTERM into a runner shutdown.
async fn forward_signals(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}
