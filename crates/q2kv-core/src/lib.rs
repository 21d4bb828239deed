//! q2kv Core - transactional queue to sorted key/value store batch sink
//!
//! This library drains events from a transactional source and writes them as
//! row mutations into a sorted key/value store with:
//!
//! - All-or-nothing batches: a source transaction commits only after every
//!   mutation of its events was accepted by the writer
//! - Pluggable event to mutation conversion selected by name
//! - A buffered asynchronous writer with memory, latency and concurrency limits
//! - Column visibility expressions evaluated against reader authorizations

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod health;
pub mod metrics;
pub mod mutation;
pub mod serializer;
pub mod source;
pub mod store;
pub mod visibility;

// Re-export commonly used types
pub use config::Config;
pub use engine::{BatchSink, SinkRunner, Status};
pub use error::{ConnectionError, SerializationError, SourceError, WriteError};
pub use error::{Error, FaultKind, Result};
pub use event::EventRecord;
pub use mutation::{ColumnUpdate, ColumnVisibility, Mutation};
pub use visibility::Authorizations;
