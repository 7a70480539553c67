//! Administrative surface over the shared state.
//!
//! Not routed over HTTP; the binary logs a report on shutdown and embedders
//! can call these directly.

use crate::resilience::{CircuitSnapshot, ErrorStatistics, HealthStatus, ResilienceExecutor};
use crate::state::AppState;
use crate::ws::registry::{ConnectionId, RegistryStatistics};
use crate::ws::session_state::HealthReport;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorHealth {
    pub name: String,
    pub status: HealthStatus,
    pub circuit: CircuitSnapshot,
    pub errors: ErrorStatistics,
}

/// Everything an operator looks at, in one serializable value.
#[derive(Debug, Clone, Serialize)]
pub struct AdminReport {
    pub executors: Vec<ExecutorHealth>,
    pub sessions: HealthReport,
    pub connections: RegistryStatistics,
}

#[derive(Clone)]
pub struct Admin {
    state: Arc<AppState>,
}

impl Admin {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    fn executors(&self) -> [&ResilienceExecutor; 2] {
        [
            self.state.upstream_executor.as_ref(),
            self.state.device_executor.as_ref(),
        ]
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.executors()
            .iter()
            .map(|e| e.breaker().snapshot())
            .collect()
    }

    pub fn executor_health(&self) -> Vec<ExecutorHealth> {
        self.executors()
            .iter()
            .map(|e| ExecutorHealth {
                name: e.name().to_string(),
                status: e.health_status(),
                circuit: e.breaker().snapshot(),
                errors: e.error_statistics(),
            })
            .collect()
    }

    pub fn session_health_report(&self) -> HealthReport {
        self.state.sessions.health_report()
    }

    /// Evicts every unhealthy session; their connections close on their own.
    pub fn force_evict_unhealthy(&self) -> Vec<ConnectionId> {
        let evicted = self.state.sessions.force_evict_unhealthy();
        info!(count = evicted.len(), "Forced eviction of unhealthy sessions.");
        evicted
    }

    /// Closes the named circuit. Returns false if no executor has that name.
    pub fn reset_circuit(&self, name: &str) -> bool {
        match self.executors().into_iter().find(|e| e.name() == name) {
            Some(executor) => {
                executor.breaker().reset();
                true
            }
            None => {
                warn!(circuit = %name, "Reset requested for unknown circuit.");
                false
            }
        }
    }

    pub fn connection_statistics(&self) -> RegistryStatistics {
        self.state.registry.statistics()
    }

    pub fn report(&self) -> AdminReport {
        AdminReport {
            executors: self.executor_health(),
            sessions: self.session_health_report(),
            connections: self.connection_statistics(),
        }
    }
}
