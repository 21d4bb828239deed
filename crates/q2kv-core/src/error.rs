//! Error types for q2kv core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Every error maps onto a [`FaultKind`], which is what the batch sink uses to
//! decide between rolling back with a backoff and handing the error to its
//! caller.

use bytes::Bytes;
use thiserror::Error;

/// Result type alias for q2kv operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for q2kv.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Store connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Transactional source error
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Event serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Mutation write error
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// Unrecoverable runtime failure
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fault categories used for recovery decisions, metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Missing or invalid configuration, or a lifecycle violation
    Configuration,
    /// Store unreachable, unauthenticated, or table missing
    Connection,
    /// The transactional source failed to take, commit or roll back
    Source,
    /// A mutation builder failed to convert an event
    Serialization,
    /// The writer rejected one or more mutations
    WriteRejection,
    /// Unrecoverable platform failure
    Fatal,
}

impl FaultKind {
    /// All fault kinds, in export order.
    pub const ALL: [FaultKind; 6] = [
        FaultKind::Configuration,
        FaultKind::Connection,
        FaultKind::Source,
        FaultKind::Serialization,
        FaultKind::WriteRejection,
        FaultKind::Fatal,
    ];

    /// Get the label value used in logs and metric labels.
    pub fn as_label(&self) -> &'static str {
        match self {
            FaultKind::Configuration => "configuration",
            FaultKind::Connection => "connection",
            FaultKind::Source => "source",
            FaultKind::Serialization => "serialization",
            FaultKind::WriteRejection => "write_rejection",
            FaultKind::Fatal => "fatal",
        }
    }

    /// Whether a cycle that hit this fault rolls back and backs off
    /// instead of returning the error to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FaultKind::Source | FaultKind::Serialization | FaultKind::WriteRejection
        )
    }
}

impl Error {
    /// Classify this error.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Error::Config(_) | Error::Lifecycle(_) | Error::Io(_) => FaultKind::Configuration,
            Error::Connection(_) => FaultKind::Connection,
            Error::Source(_) => FaultKind::Source,
            Error::Serialization(_) => FaultKind::Serialization,
            Error::Write(_) => FaultKind::WriteRejection,
            Error::Fatal(_) => FaultKind::Fatal,
        }
    }
}

/// Store connection errors.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// No store instance with this name is reachable
    #[error("Instance not found: {instance} (servers: {servers})")]
    InstanceNotFound { instance: String, servers: String },

    /// Credentials were rejected
    #[error("Authentication failed for user {user}")]
    AuthenticationFailed { user: String },

    /// Target table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table already exists
    #[error("Table already exists: {0}")]
    TableExists(String),
}

/// Transactional source errors.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The channel cannot hold more events
    #[error("Channel {channel} full: capacity {capacity}")]
    ChannelFull { channel: String, capacity: usize },

    /// A transaction took more events than it may hold
    #[error("Transaction capacity {capacity} exceeded on channel {channel}")]
    TransactionCapacityExceeded { channel: String, capacity: usize },

    /// Operation is not valid in the transaction's current state
    #[error("Invalid transaction state: cannot {operation} while {state}")]
    InvalidTransactionState {
        operation: &'static str,
        state: &'static str,
    },

    /// Generic source failure
    #[error("{0}")]
    Other(String),
}

/// Event serialization errors.
#[derive(Error, Debug)]
pub enum SerializationError {
    /// Malformed column visibility expression
    #[error("Invalid visibility expression {expression:?} at position {position}: {message}")]
    InvalidVisibility {
        expression: String,
        position: usize,
        message: String,
    },

    /// `produce` was called without an accepted event
    #[error("No event accepted before producing mutations")]
    NoEvent,

    /// Event could not be decoded from its wire form
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Generic builder failure
    #[error("{0}")]
    Other(String),
}

/// A mutation the store refused to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedMutation {
    /// Row key of the rejected mutation
    pub row: Bytes,
    /// Why it was rejected
    pub reason: String,
}

/// Mutation write errors.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Mutations were permanently rejected by the store
    #[error("{} mutation(s) rejected{}", .rejected.len(), first_reason(.rejected))]
    MutationsRejected { rejected: Vec<RejectedMutation> },

    /// A mutation without column updates was submitted
    #[error("Mutation for row {row:?} has no column updates")]
    EmptyMutation { row: Bytes },

    /// The writer has been closed
    #[error("Writer closed")]
    Closed,
}

fn first_reason(rejected: &[RejectedMutation]) -> String {
    rejected
        .first()
        .map(|r| format!(": {}", r.reason))
        .unwrap_or_default()
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(SerializationError::InvalidEvent(err.to_string()))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
