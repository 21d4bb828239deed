//! Batch transaction loop.
//!
//! Each call to [`BatchSink::process`] runs one cycle: open a source
//! transaction, take up to `batch_size` events, convert them to mutations,
//! submit the mutations to the writer in one call and commit. Any failure
//! rolls the whole transaction back so the source redelivers every event of
//! the batch.

use crate::config::Config;
use crate::error::FaultKind;
use crate::event::EventRecord;
use crate::metrics::SinkCounter;
use crate::mutation::Mutation;
use crate::serializer::{MutationBuilder, SerializerOptions, SerializerRegistry};
use crate::source::{EventSource, SourceTransaction};
use crate::store::{MemoryStore, MutationWriter, StoreConnector};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A full batch was committed; call again right away.
    Ready,
    /// The source ran dry or the cycle failed; wait before calling again.
    Backoff,
}

/// Sink lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not configured
    Created,
    /// Configuration validated and builder resolved
    Configured,
    /// Connected with an open writer
    Started,
    /// Closing the writer
    Stopping,
    /// Writer closed
    Stopped,
}

impl LifecycleState {
    /// Lowercase name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Configured => "configured",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent cycle failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleFault {
    /// Fault category
    pub kind: FaultKind,
    /// Error message
    pub message: String,
}

/// Closes the wrapped transaction when dropped unless it was closed
/// explicitly.
pub struct TransactionGuard {
    transaction: Box<dyn SourceTransaction>,
    closed: bool,
}

impl TransactionGuard {
    /// Wrap an open transaction.
    pub fn new(transaction: Box<dyn SourceTransaction>) -> Self {
        Self {
            transaction,
            closed: false,
        }
    }

    /// Take the next event.
    pub async fn take(&mut self) -> Result<Option<EventRecord>> {
        self.transaction.take().await
    }

    /// Commit the transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.transaction.commit().await
    }

    /// Roll the transaction back.
    pub async fn rollback(&mut self) -> Result<()> {
        self.transaction.rollback().await
    }

    /// Close the transaction now.
    pub fn close(mut self) {
        self.transaction.close();
        self.closed = true;
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if !self.closed {
            self.transaction.close();
        }
    }
}

/// Drains a transactional source into a store in bounded batches.
pub struct BatchSink {
    name: String,
    source: Arc<dyn EventSource>,
    connector: Option<Arc<dyn StoreConnector>>,
    registry: SerializerRegistry,
    counter: Arc<SinkCounter>,
    config: Option<Config>,
    builder: Option<Box<dyn MutationBuilder>>,
    writer: Option<Box<dyn MutationWriter>>,
    state: LifecycleState,
    last_fault: Option<CycleFault>,
    last_taken: u64,
}

impl BatchSink {
    /// Create a sink reading from `source`.
    pub fn new(name: impl Into<String>, source: Arc<dyn EventSource>) -> Self {
        Self {
            name: name.into(),
            source,
            connector: None,
            registry: SerializerRegistry::with_defaults(),
            counter: Arc::new(SinkCounter::new()),
            config: None,
            builder: None,
            writer: None,
            state: LifecycleState::Created,
            last_fault: None,
            last_taken: 0,
        }
    }

    /// Use an existing store connection instead of connecting from the
    /// `[store]` configuration.
    pub fn with_connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a custom builder registry.
    pub fn with_registry(mut self, registry: SerializerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Share counters with the caller.
    pub fn with_counter(mut self, counter: Arc<SinkCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Sink name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Sink counters.
    pub fn counter(&self) -> &Arc<SinkCounter> {
        &self.counter
    }

    /// Failure of the most recent cycle, if it failed.
    pub fn last_fault(&self) -> Option<&CycleFault> {
        self.last_fault.as_ref()
    }

    /// Events taken by the most recent cycle.
    pub fn last_taken(&self) -> u64 {
        self.last_taken
    }

    /// Validate configuration and resolve the mutation builder.
    pub fn configure(&mut self, config: &Config) -> Result<()> {
        if !matches!(
            self.state,
            LifecycleState::Created | LifecycleState::Configured
        ) {
            return Err(Error::Lifecycle(format!(
                "cannot configure sink {} while {}",
                self.name, self.state
            )));
        }

        config.validate()?;
        if self.connector.is_none() {
            config.validate_connection()?;
        }

        let options = SerializerOptions::from(config.sink.serializer_options.clone());
        let builder = self.registry.create(&config.sink.serializer, &options)?;

        self.builder = Some(builder);
        self.config = Some(config.clone());
        self.state = LifecycleState::Configured;

        info!(
            sink = %self.name,
            table = %config.sink.table,
            batch_size = config.sink.batch_size,
            serializer = %config.sink.serializer,
            "Sink configured"
        );
        Ok(())
    }

    /// Connect to the store and open the writer.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != LifecycleState::Configured {
            return Err(Error::Lifecycle(format!(
                "cannot start sink {} while {}",
                self.name, self.state
            )));
        }
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| Error::Lifecycle("sink has no configuration".into()))?;

        let writer = match open_writer(self.connector.as_ref(), config).await {
            Ok(writer) => writer,
            Err(e) => {
                self.counter.record_connection_failed();
                error!(
                    sink = %self.name,
                    table = %config.sink.table,
                    error = %e,
                    "Failed to connect to store"
                );
                return Err(e);
            }
        };

        self.counter.record_connection_created();
        self.writer = Some(writer);
        self.state = LifecycleState::Started;
        info!(sink = %self.name, table = %config.sink.table, "Sink started");
        Ok(())
    }

    /// Run one cycle.
    ///
    /// Source, serialization and write failures roll the transaction back
    /// and return `Ok(Status::Backoff)`. Fatal failures are returned as
    /// errors.
    pub async fn process(&mut self) -> Result<Status> {
        if self.state != LifecycleState::Started {
            return Err(Error::Lifecycle(format!(
                "cannot process sink {} while {}",
                self.name, self.state
            )));
        }
        let (Some(config), Some(builder), Some(writer)) = (
            self.config.as_ref(),
            self.builder.as_mut(),
            self.writer.as_ref(),
        ) else {
            return Err(Error::Lifecycle(format!(
                "sink {} started without a writer",
                self.name
            )));
        };

        let started = Instant::now();
        let mut cycle = Cycle {
            source: self.source.as_ref(),
            builder: builder.as_mut(),
            writer: writer.as_ref(),
            counter: &self.counter,
            batch_size: config.sink.batch_size,
            taken: 0,
        };
        let result = cycle.run().await;
        let taken = cycle.taken;
        self.counter.record_cycle(started.elapsed());
        self.last_taken = taken;

        match result {
            Ok(status) => {
                self.last_fault = None;
                debug!(sink = %self.name, taken, status = ?status, "Cycle complete");
                Ok(status)
            }
            Err(e) => {
                let kind = e.fault_kind();
                self.counter.record_error(kind);
                self.last_fault = Some(CycleFault {
                    kind,
                    message: e.to_string(),
                });

                if kind == FaultKind::Fatal {
                    error!(sink = %self.name, fault = kind.as_label(), error = %e, "Fatal cycle failure");
                    return Err(e);
                }
                if kind.is_recoverable() {
                    warn!(sink = %self.name, fault = kind.as_label(), taken, error = %e, "Cycle rolled back");
                } else {
                    error!(sink = %self.name, fault = kind.as_label(), taken, error = %e, "Cycle rolled back");
                }
                Ok(Status::Backoff)
            }
        }
    }

    /// Close the writer and release the builder. Idempotent and safe when
    /// never started.
    ///
    /// Returns the writer's rejection error if closing surfaced one; the sink
    /// is stopped either way.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Stopping | LifecycleState::Stopped => return Ok(()),
            LifecycleState::Created | LifecycleState::Configured => {
                self.release_builder();
                self.state = LifecycleState::Stopped;
                info!(sink = %self.name, "Sink stopped before start");
                return Ok(());
            }
            LifecycleState::Started => {}
        }

        self.state = LifecycleState::Stopping;
        let result = match self.writer.take() {
            Some(writer) => writer.close().await,
            None => Ok(()),
        };
        self.counter.record_connection_closed();
        self.release_builder();
        self.state = LifecycleState::Stopped;

        match &result {
            Ok(()) => info!(sink = %self.name, "Sink stopped"),
            Err(e) => warn!(sink = %self.name, error = %e, "Sink stopped with writer errors"),
        }
        result
    }

    fn release_builder(&mut self) {
        if let Some(builder) = self.builder.as_mut() {
            builder.release();
        }
    }
}

async fn open_writer(
    connector: Option<&Arc<dyn StoreConnector>>,
    config: &Config,
) -> Result<Box<dyn MutationWriter>> {
    let table = &config.sink.table;
    match connector {
        Some(connector) => connector.create_writer(table, &config.writer).await,
        None => {
            let connector = MemoryStore::connect(&config.store)?;
            connector.create_writer(table, &config.writer).await
        }
    }
}

/// State of one processing cycle.
struct Cycle<'a> {
    source: &'a dyn EventSource,
    builder: &'a mut dyn MutationBuilder,
    writer: &'a dyn MutationWriter,
    counter: &'a SinkCounter,
    batch_size: usize,
    taken: u64,
}

impl Cycle<'_> {
    async fn run(&mut self) -> Result<Status> {
        let transaction = self.source.begin_transaction().await?;
        let mut guard = TransactionGuard::new(transaction);

        match self.drain(&mut guard).await {
            Ok(status) => {
                guard.close();
                Ok(status)
            }
            Err(e) => {
                if let Err(rollback_err) = guard.rollback().await {
                    warn!(
                        error = %rollback_err,
                        original = %e,
                        "Rollback failed"
                    );
                }
                self.counter.record_rollback();
                guard.close();
                Err(e)
            }
        }
    }

    async fn drain(&mut self, guard: &mut TransactionGuard) -> Result<Status> {
        let mut status = Status::Backoff;
        let mut pending: Vec<Mutation> = Vec::new();
        let mut pulled = 0usize;

        while pulled < self.batch_size {
            let Some(event) = guard.take().await? else {
                if pulled == 0 {
                    self.counter.record_batch_empty();
                } else {
                    self.counter.record_batch_underflow();
                }
                break;
            };
            pulled += 1;
            self.taken = pulled as u64;

            self.builder.accept(&event);
            pending.extend(self.builder.produce()?);
        }

        if pulled == self.batch_size {
            status = Status::Ready;
            self.counter.record_batch_complete();
        }
        self.counter.add_drain_attempts(pulled as u64);

        if !pending.is_empty() {
            let count = pending.len() as u64;
            self.writer.submit(pending).await?;
            self.counter.add_mutations_submitted(count);
        }

        guard.commit().await?;
        self.counter.add_drain_successes(pulled as u64);
        Ok(status)
    }
}
