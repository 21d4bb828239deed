//! Transactional event sources.
//!
//! A source hands out events under a transaction. Events taken in a
//! transaction are removed for good on commit and become available again on
//! rollback.

mod memory;

pub use memory::MemoryChannel;

use crate::event::EventRecord;
use crate::Result;
use async_trait::async_trait;

/// A transactional source of events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Source name, used in logs.
    fn name(&self) -> &str;

    /// Open a new transaction.
    async fn begin_transaction(&self) -> Result<Box<dyn SourceTransaction>>;
}

/// An open transaction on an [`EventSource`].
#[async_trait]
pub trait SourceTransaction: Send {
    /// Take the next event, or `None` when the source is currently empty.
    async fn take(&mut self) -> Result<Option<EventRecord>>;

    /// Permanently consume every event taken in this transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Return every event taken in this transaction to the source.
    async fn rollback(&mut self) -> Result<()>;

    /// Release the transaction. Idempotent; an uncommitted transaction is
    /// rolled back.
    fn close(&mut self);
}
