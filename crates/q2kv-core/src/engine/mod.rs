//! Batch sink engine: the per-cycle transaction loop and the host loop that
//! drives it.

mod runner;
mod sink;

pub use runner::{BackoffConfig, SinkRunner};
pub use sink::{BatchSink, CycleFault, LifecycleState, Status, TransactionGuard};
