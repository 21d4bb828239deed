//! Sink metrics.

mod prometheus;

pub use self::prometheus::{CycleDurationHistogram, SinkCounter, DEFAULT_PREFIX};
