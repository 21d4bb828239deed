//! Store-side collaborators.
//!
//! - [`StoreConnector`]: an authenticated connection able to open writers.
//! - [`MutationWriter`]: accepts mutations for one table and flushes them.
//! - [`TabletServer`]: the store-side target a buffered writer flushes to.

mod memory;
mod writer;

pub use memory::{Cell, CellKey, Constraint, MemoryConnector, MemoryStore};
pub use writer::{BufferedMutationWriter, WriterStats};

use crate::config::WriterConfig;
use crate::error::RejectedMutation;
use crate::mutation::Mutation;
use crate::Result;
use async_trait::async_trait;

/// Applies mutations to a table.
#[async_trait]
pub trait TabletServer: Send + Sync {
    /// Apply mutations, each atomically. Returns the mutations that were
    /// refused; all others are durable.
    async fn apply(&self, table: &str, mutations: Vec<Mutation>) -> Result<Vec<RejectedMutation>>;
}

/// An authenticated store connection.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Whether a table exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Open a writer for an existing table.
    async fn create_writer(
        &self,
        table: &str,
        config: &WriterConfig,
    ) -> Result<Box<dyn MutationWriter>>;
}

/// Buffered mutation sink for one table.
#[async_trait]
pub trait MutationWriter: Send + Sync {
    /// Queue mutations. May wait for buffer space. Returns an error if any
    /// mutation is invalid or an earlier flush had rejections.
    async fn submit(&self, mutations: Vec<Mutation>) -> Result<()>;

    /// Wait until every queued mutation has been applied or rejected.
    async fn flush(&self) -> Result<()>;

    /// Flush and release the writer. A second call is a no-op.
    async fn close(&self) -> Result<()>;
}
