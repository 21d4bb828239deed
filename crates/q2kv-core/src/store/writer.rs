//! Buffered asynchronous mutation writer.
//!
//! Mutations are buffered in memory and flushed to a [`TabletServer`] by
//! background tasks when
//!
//! - buffered bytes reach half of `max_memory`,
//! - the latency ticker fires (every `max_latency_ms`),
//! - or `flush`/`close` is called.
//!
//! At most `max_write_threads` flushes run at once. `submit` waits while
//! buffered plus in-flight bytes would exceed `max_memory`. Rejections from a
//! background flush are latched and reported by the next `submit`, `flush`
//! or `close`.

use super::{MutationWriter, TabletServer};
use crate::config::WriterConfig;
use crate::error::{RejectedMutation, WriteError};
use crate::mutation::Mutation;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshot of writer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Mutations accepted by `submit`
    pub mutations_submitted: u64,
    /// Mutations applied by the server
    pub mutations_written: u64,
    /// Mutations refused by the server
    pub mutations_rejected: u64,
    /// Flush tasks started
    pub flushes: u64,
    /// Bytes currently buffered and not yet handed to a flush
    pub buffered_bytes: u64,
    /// Bytes currently being flushed
    pub in_flight_bytes: u64,
}

#[derive(Default)]
struct Buffer {
    mutations: Vec<Mutation>,
    bytes: u64,
}

struct Inner {
    table: String,
    server: Arc<dyn TabletServer>,
    max_memory: u64,
    buffer: Mutex<Buffer>,
    in_flight_bytes: AtomicU64,
    pending_flushes: AtomicUsize,
    permits: Arc<Semaphore>,
    space_available: Notify,
    idle: Notify,
    rejected: Mutex<Vec<RejectedMutation>>,
    closed: AtomicBool,
    mutations_submitted: AtomicU64,
    mutations_written: AtomicU64,
    mutations_rejected: AtomicU64,
    flushes: AtomicU64,
}

impl Inner {
    /// Hand everything currently buffered to a background flush task.
    fn start_flush(self: &Arc<Self>) {
        let (batch, bytes) = {
            let mut buffer = self.buffer.lock();
            if buffer.mutations.is_empty() {
                return;
            }
            let batch = std::mem::take(&mut buffer.mutations);
            let bytes = std::mem::take(&mut buffer.bytes);
            // Accounted under the buffer lock.
            self.in_flight_bytes.fetch_add(bytes, Ordering::SeqCst);
            self.pending_flushes.fetch_add(1, Ordering::SeqCst);
            (batch, bytes)
        };

        self.flushes.fetch_add(1, Ordering::Relaxed);
        let guard = FlushGuard {
            inner: Arc::clone(self),
            bytes,
        };
        tokio::spawn(async move {
            let _permit = Arc::clone(&guard.inner.permits).acquire_owned().await.ok();
            guard.inner.apply(batch).await;
        });
    }

    async fn apply(&self, batch: Vec<Mutation>) {
        let count = batch.len() as u64;
        let rows: Vec<Bytes> = batch.iter().map(|m| m.row().clone()).collect();

        // A panicking server surfaces as a join error instead of unwinding
        // through the flush task.
        let server = Arc::clone(&self.server);
        let table = self.table.clone();
        let outcome = tokio::spawn(async move { server.apply(&table, batch).await }).await;

        let rejected = match outcome {
            Ok(Ok(rejected)) => rejected,
            Ok(Err(e)) => {
                warn!(table = %self.table, error = %e, "Flush failed, rejecting batch");
                reject_all(rows, &e.to_string())
            }
            Err(e) => {
                warn!(table = %self.table, error = %e, "Flush task failed, rejecting batch");
                reject_all(rows, &format!("flush task failed: {e}"))
            }
        };

        let rejected_count = rejected.len() as u64;
        self.mutations_written
            .fetch_add(count.saturating_sub(rejected_count), Ordering::Relaxed);
        debug!(
            table = %self.table,
            mutations = count,
            rejected = rejected_count,
            "Flushed mutations"
        );

        if !rejected.is_empty() {
            self.mutations_rejected
                .fetch_add(rejected_count, Ordering::Relaxed);
            self.rejected.lock().extend(rejected);
        }
    }

    fn buffered_bytes(&self) -> u64 {
        self.buffer.lock().bytes
    }

    /// Report and clear latched rejections.
    fn take_rejections(&self) -> Result<()> {
        let rejected = std::mem::take(&mut *self.rejected.lock());
        if rejected.is_empty() {
            return Ok(());
        }
        Err(WriteError::MutationsRejected { rejected }.into())
    }

    /// Buffer one mutation, waiting for memory to free up if needed.
    async fn enqueue(self: &Arc<Self>, mutation: Mutation) {
        let size = mutation.estimated_size() as u64;
        let mut mutation = Some(mutation);

        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let flush_needed = {
                let mut buffer = self.buffer.lock();
                let used = buffer.bytes + self.in_flight_bytes.load(Ordering::SeqCst);
                // An oversized mutation is admitted once nothing else is held.
                if used + size <= self.max_memory || used == 0 {
                    if let Some(m) = mutation.take() {
                        buffer.mutations.push(m);
                        buffer.bytes += size;
                    }
                    None
                } else {
                    Some(!buffer.mutations.is_empty())
                }
            };

            match flush_needed {
                None => break,
                Some(true) => self.start_flush(),
                Some(false) => {}
            }
            notified.await;
        }

        if self.buffered_bytes() >= self.max_memory / 2 {
            self.start_flush();
        }
    }

    /// Wait until no flush task is running.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_flushes.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn drain(self: &Arc<Self>) {
        loop {
            self.start_flush();
            self.wait_idle().await;
            if self.buffer.lock().mutations.is_empty() {
                return;
            }
        }
    }
}

/// Releases a flush's memory and pending count however its task ends.
struct FlushGuard {
    inner: Arc<Inner>,
    bytes: u64,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight_bytes
            .fetch_sub(self.bytes, Ordering::SeqCst);
        self.inner.pending_flushes.fetch_sub(1, Ordering::SeqCst);
        self.inner.space_available.notify_waiters();
        self.inner.idle.notify_waiters();
    }
}

fn reject_all(rows: Vec<Bytes>, reason: &str) -> Vec<RejectedMutation> {
    rows.into_iter()
        .map(|row| RejectedMutation {
            row,
            reason: reason.to_string(),
        })
        .collect()
}

/// A [`MutationWriter`] that buffers mutations and flushes them to a
/// [`TabletServer`] in the background.
pub struct BufferedMutationWriter {
    inner: Arc<Inner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedMutationWriter {
    /// Create a writer for `table`. Must be called inside a tokio runtime
    /// when latency flushing is enabled.
    pub fn new(
        table: impl Into<String>,
        server: Arc<dyn TabletServer>,
        config: &WriterConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            table: table.into(),
            server,
            max_memory: config.max_memory,
            buffer: Mutex::new(Buffer::default()),
            in_flight_bytes: AtomicU64::new(0),
            pending_flushes: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(config.max_write_threads.max(1))),
            space_available: Notify::new(),
            idle: Notify::new(),
            rejected: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            mutations_submitted: AtomicU64::new(0),
            mutations_written: AtomicU64::new(0),
            mutations_rejected: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        });

        let ticker = config
            .max_latency()
            .map(|latency| spawn_ticker(Arc::downgrade(&inner), latency));

        debug!(
            table = %inner.table,
            max_memory = config.max_memory,
            max_latency_ms = config.max_latency_ms,
            max_write_threads = config.max_write_threads,
            "Created buffered writer"
        );

        Self {
            inner,
            ticker: Mutex::new(ticker),
        }
    }

    /// Target table.
    pub fn table(&self) -> &str {
        &self.inner.table
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current statistics.
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            mutations_submitted: self.inner.mutations_submitted.load(Ordering::Relaxed),
            mutations_written: self.inner.mutations_written.load(Ordering::Relaxed),
            mutations_rejected: self.inner.mutations_rejected.load(Ordering::Relaxed),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            buffered_bytes: self.inner.buffered_bytes(),
            in_flight_bytes: self.inner.in_flight_bytes.load(Ordering::SeqCst),
        }
    }

    fn stop_ticker(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

fn spawn_ticker(inner: Weak<Inner>, latency: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(latency);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            inner.start_flush();
        }
    })
}

#[async_trait]
impl MutationWriter for BufferedMutationWriter {
    async fn submit(&self, mutations: Vec<Mutation>) -> Result<()> {
        if self.is_closed() {
            return Err(WriteError::Closed.into());
        }
        self.inner.take_rejections()?;
        for mutation in &mutations {
            mutation.validate()?;
        }

        let count = mutations.len() as u64;
        for mutation in mutations {
            self.inner.enqueue(mutation).await;
        }
        self.inner
            .mutations_submitted
            .fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if self.is_closed() {
            return Err(WriteError::Closed.into());
        }
        self.inner.drain().await;
        self.inner.take_rejections()
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_ticker();
        self.inner.drain().await;

        let stats = self.stats();
        info!(
            table = %self.inner.table,
            written = stats.mutations_written,
            rejected = stats.mutations_rejected,
            flushes = stats.flushes,
            "Closed buffered writer"
        );
        self.inner.take_rejections()
    }
}

impl Drop for BufferedMutationWriter {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
