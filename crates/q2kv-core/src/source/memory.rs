//! Bounded in-memory transactional channel.

use super::{EventSource, SourceTransaction};
use crate::error::SourceError;
use crate::event::EventRecord;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<EventRecord>,
    /// Events taken by open transactions; they still count against capacity.
    in_flight: usize,
    committed: u64,
    committed_transactions: u64,
    redelivered: u64,
}

/// A bounded FIFO channel with begin/take/commit/rollback semantics.
///
/// Capacity covers both queued events and events held by open transactions,
/// so a rollback can always return its events.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    name: String,
    capacity: usize,
    transaction_capacity: usize,
    state: Arc<Mutex<ChannelState>>,
}

impl MemoryChannel {
    /// Create a channel holding at most `capacity` events.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            transaction_capacity: capacity,
            state: Arc::new(Mutex::new(ChannelState::default())),
        }
    }

    /// Limit the number of events one transaction may take.
    pub fn with_transaction_capacity(mut self, transaction_capacity: usize) -> Self {
        self.transaction_capacity = transaction_capacity;
        self
    }

    /// Append one event.
    pub fn put(&self, event: EventRecord) -> Result<()> {
        self.put_all(std::iter::once(event))
    }

    /// Append several events. Either all are accepted or none.
    pub fn put_all(&self, events: impl IntoIterator<Item = EventRecord>) -> Result<()> {
        let events: Vec<_> = events.into_iter().collect();
        let mut state = self.state.lock();
        if state.queue.len() + state.in_flight + events.len() > self.capacity {
            return Err(SourceError::ChannelFull {
                channel: self.name.clone(),
                capacity: self.capacity,
            }
            .into());
        }
        state.queue.extend(events);
        Ok(())
    }

    /// Events waiting to be taken.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events held by open transactions.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Total events consumed by committed transactions.
    pub fn committed_count(&self) -> u64 {
        self.state.lock().committed
    }

    /// Transactions committed, including ones that took no events.
    pub fn committed_transactions(&self) -> u64 {
        self.state.lock().committed_transactions
    }

    /// Total events returned to the channel by rollbacks.
    pub fn redelivered_count(&self) -> u64 {
        self.state.lock().redelivered
    }

    /// Maximum number of events held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl EventSource for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin_transaction(&self) -> Result<Box<dyn SourceTransaction>> {
        Ok(Box::new(MemoryTransaction {
            channel: self.name.clone(),
            transaction_capacity: self.transaction_capacity,
            state: Arc::clone(&self.state),
            taken: Vec::new(),
            status: TxStatus::Open,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Open,
    Committed,
    RolledBack,
    Closed,
}

impl TxStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Open => "open",
            TxStatus::Committed => "committed",
            TxStatus::RolledBack => "rolled back",
            TxStatus::Closed => "closed",
        }
    }
}

struct MemoryTransaction {
    channel: String,
    transaction_capacity: usize,
    state: Arc<Mutex<ChannelState>>,
    taken: Vec<EventRecord>,
    status: TxStatus,
}

impl MemoryTransaction {
    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.status != TxStatus::Open {
            return Err(SourceError::InvalidTransactionState {
                operation,
                state: self.status.as_str(),
            }
            .into());
        }
        Ok(())
    }

    fn return_taken(&mut self) {
        let mut state = self.state.lock();
        let count = self.taken.len();
        for event in self.taken.drain(..).rev() {
            state.queue.push_front(event);
        }
        state.in_flight -= count;
        state.redelivered += count as u64;
        if count > 0 {
            debug!(channel = %self.channel, count, "Returned events to channel");
        }
    }
}

#[async_trait]
impl SourceTransaction for MemoryTransaction {
    async fn take(&mut self) -> Result<Option<EventRecord>> {
        self.ensure_open("take")?;
        if self.taken.len() >= self.transaction_capacity {
            return Err(SourceError::TransactionCapacityExceeded {
                channel: self.channel.clone(),
                capacity: self.transaction_capacity,
            }
            .into());
        }

        let mut state = self.state.lock();
        let Some(event) = state.queue.pop_front() else {
            return Ok(None);
        };
        state.in_flight += 1;
        drop(state);

        self.taken.push(event.clone());
        Ok(Some(event))
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        let count = self.taken.len();
        {
            let mut state = self.state.lock();
            state.in_flight -= count;
            state.committed += count as u64;
            state.committed_transactions += 1;
        }
        self.taken.clear();
        self.status = TxStatus::Committed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open("rollback")?;
        self.return_taken();
        self.status = TxStatus::RolledBack;
        Ok(())
    }

    fn close(&mut self) {
        if self.status == TxStatus::Open {
            self.return_taken();
        }
        self.status = TxStatus::Closed;
    }
}
