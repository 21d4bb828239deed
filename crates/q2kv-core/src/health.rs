//! Component health tracking for the sink.
//!
//! The runner reports on three components: the event source, the mutation
//! builder and the store writer. Readiness additionally requires the sink to
//! be running.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Event source component.
pub const SOURCE: &str = "source";
/// Mutation builder component.
pub const SERIALIZER: &str = "serializer";
/// Store writer component.
pub const STORE: &str = "store";

/// Components tracked for a running sink.
pub const SINK_COMPONENTS: [&str; 3] = [SOURCE, SERIALIZER, STORE];

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component works but its last operation failed
    Degraded(String),
    /// Component cannot work
    Unhealthy(String),
    /// No report yet
    Unknown,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// At least one component unhealthy
    Unhealthy,
}

/// Serializable health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Whether the sink loop is running
    pub running: bool,
    /// Seconds since the sink started running
    pub uptime_seconds: Option<u64>,
    /// Status per component
    pub components: BTreeMap<String, ComponentStatus>,
}

/// Health check manager for tracking component health.
pub struct HealthCheck {
    components: RwLock<HashMap<String, ComponentStatus>>,
    running_since: RwLock<Option<Instant>>,
}

impl HealthCheck {
    /// Create a new health check manager.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            running_since: RwLock::new(None),
        }
    }

    /// Create a manager tracking the sink components.
    pub fn for_sink() -> Self {
        let health = Self::new();
        for component in SINK_COMPONENTS {
            health.register_component(component);
        }
        health
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        self.components
            .write()
            .insert(name.to_string(), ComponentStatus::Unknown);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Degraded(reason.to_string()));
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        self.set(name, ComponentStatus::Unhealthy(reason.to_string()));
    }

    fn set(&self, name: &str, status: ComponentStatus) {
        self.components.write().insert(name.to_string(), status);
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().get(name).cloned()
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Get overall health status.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Operational and the sink loop is running.
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.is_operational()
    }

    /// Mark the sink loop as running.
    pub fn sink_started(&self) {
        *self.running_since.write() = Some(Instant::now());
    }

    /// Mark the sink loop as stopped.
    pub fn sink_stopped(&self) {
        *self.running_since.write() = None;
    }

    /// Check if the sink loop is running.
    pub fn is_running(&self) -> bool {
        self.running_since.read().is_some()
    }

    /// Snapshot for serving over HTTP.
    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            running: self.is_running(),
            uptime_seconds: self.running_since.read().map(|t| t.elapsed().as_secs()),
            components: self.get_all_statuses().into_iter().collect(),
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_sink_registers_components() {
        let health = HealthCheck::for_sink();
        for component in SINK_COMPONENTS {
            assert_eq!(
                health.get_component_status(component),
                Some(ComponentStatus::Unknown)
            );
        }
        assert_eq!(health.overall_status(), HealthStatus::Healthy);
        assert!(!health.is_ready());
    }

    #[test]
    fn test_health_status_priority() {
        let health = HealthCheck::for_sink();
        health.mark_healthy(SOURCE);
        health.mark_healthy(SERIALIZER);
        health.mark_healthy(STORE);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_degraded(STORE, "mutations rejected");
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
        assert!(health.is_operational());

        health.mark_unhealthy(SOURCE, "fatal");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        assert!(!health.is_operational());

        health.mark_healthy(SOURCE);
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
    }

    #[test]
    fn test_readiness_follows_sink() {
        let health = HealthCheck::for_sink();
        assert!(!health.is_running());

        health.sink_started();
        assert!(health.is_ready());

        health.mark_unhealthy(STORE, "closed");
        assert!(!health.is_ready());

        health.mark_healthy(STORE);
        health.sink_stopped();
        assert!(!health.is_ready());
    }

    #[test]
    fn test_unknown_component() {
        let health = HealthCheck::new();
        assert_eq!(health.get_component_status("missing"), None);
    }

    #[test]
    fn test_report_serialization() {
        let health = HealthCheck::for_sink();
        health.sink_started();
        health.mark_healthy(SOURCE);
        health.mark_degraded(SERIALIZER, "invalid visibility");

        let report = health.report();
        assert!(report.running);
        assert_eq!(report.uptime_seconds, Some(0));
        assert_eq!(report.components.len(), 3);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["components"]["source"]["status"], "healthy");
        assert_eq!(
            json["components"]["serializer"]["reason"],
            "invalid visibility"
        );
        assert_eq!(json["components"]["store"]["status"], "unknown");
    }
}
