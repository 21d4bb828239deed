//! Host loop driving a [`BatchSink`].

use super::sink::{BatchSink, Status};
use crate::error::FaultKind;
use crate::health::{self, HealthCheck};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Backoff policy applied between cycles that report [`Status::Backoff`].
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first backoff
    pub base_delay: Duration,
    /// Upper bound on the delay
    pub max_delay: Duration,
    /// Spread delays by ±25%
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Create a backoff policy without jitter.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Enable jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay for the given number of consecutive backoffs (0-based).
    ///
    /// Uses exponential backoff: min(max_delay, base_delay * 2^attempt)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter {
            let jitter_range = capped_delay_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_delay_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }
}

/// Health component affected by a fault.
fn component_for(kind: FaultKind) -> &'static str {
    match kind {
        FaultKind::Source => health::SOURCE,
        FaultKind::Serialization => health::SERIALIZER,
        FaultKind::Configuration
        | FaultKind::Connection
        | FaultKind::WriteRejection
        | FaultKind::Fatal => health::STORE,
    }
}

/// Runs cycles of a started sink until shutdown, a fatal error or, when
/// requested, the source runs dry.
pub struct SinkRunner {
    sink: BatchSink,
    backoff: BackoffConfig,
    health: Arc<HealthCheck>,
    shutdown_tx: broadcast::Sender<()>,
    exit_when_drained: bool,
}

impl SinkRunner {
    /// Create a runner for a started sink.
    pub fn new(sink: BatchSink) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            sink,
            backoff: BackoffConfig::default(),
            health: Arc::new(HealthCheck::for_sink()),
            shutdown_tx,
            exit_when_drained: false,
        }
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Report into a shared health check.
    pub fn with_health(mut self, health: Arc<HealthCheck>) -> Self {
        for component in health::SINK_COMPONENTS {
            if health.get_component_status(component).is_none() {
                health.register_component(component);
            }
        }
        self.health = health;
        self
    }

    /// Stop once a cycle finds the source empty.
    pub fn exit_when_drained(mut self, exit: bool) -> Self {
        self.exit_when_drained = exit;
        self
    }

    /// Sender that stops the loop when signalled.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Health check updated by the loop.
    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// The driven sink.
    pub fn sink(&self) -> &BatchSink {
        &self.sink
    }

    /// Consume the runner and return the sink.
    pub fn into_sink(self) -> BatchSink {
        self.sink
    }

    /// Run the loop. The sink is always stopped on return.
    pub async fn run(&mut self) -> Result<()> {
        self.health.sink_started();
        info!(sink = %self.sink.name(), "Sink runner started");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt = 0u32;

        let result = loop {
            let status = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break Ok(());
                }
                result = self.sink.process() => result,
            };

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    error!(sink = %self.sink.name(), error = %e, "Stopping sink after fatal error");
                    self.health
                        .mark_unhealthy(component_for(e.fault_kind()), &e.to_string());
                    break Err(e);
                }
            };
            self.report_health();

            match status {
                Status::Ready => attempt = 0,
                Status::Backoff => {
                    if self.exit_when_drained
                        && self.sink.last_fault().is_none()
                        && self.sink.last_taken() == 0
                    {
                        info!(sink = %self.sink.name(), "Source drained");
                        break Ok(());
                    }

                    let delay = self.backoff.calculate_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    debug!(delay_ms = delay.as_millis() as u64, attempt, "Backing off");

                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("Shutdown signal received");
                            break Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.health.sink_stopped();
        let stopped = self.sink.stop().await;
        info!(sink = %self.sink.name(), "Sink runner stopped");

        match (result, stopped) {
            (Err(e), Err(stop_err)) => {
                error!(error = %stop_err, "Error while stopping sink");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), stopped) => stopped,
        }
    }

    fn report_health(&self) {
        match self.sink.last_fault() {
            None => {
                for component in health::SINK_COMPONENTS {
                    self.health.mark_healthy(component);
                }
            }
            Some(fault) => {
                self.health
                    .mark_degraded(component_for(fault.kind), &fault.message);
            }
        }
    }
}
