//! Controller health tracking.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Monitor session with the hypervisor.
pub const SUBSYSTEM_MONITOR: &str = "monitor";
/// Guest memory telemetry.
pub const SUBSYSTEM_TELEMETRY: &str = "telemetry";
/// Persisted controller state.
pub const SUBSYSTEM_STATE: &str = "state";

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub version: String,
    pub subsystems: Vec<SubsystemHealth>,
}

impl HealthCheck {
    pub fn subsystem(&self, name: &str) -> Option<&SubsystemHealth> {
        self.subsystems.iter().find(|s| s.name == name)
    }
}

/// Subsystem health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Tracks the health of the controller's subsystems.
#[derive(Clone)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self { subsystems: Arc::new(RwLock::new(Vec::new())) }
    }

    /// Checker with the monitor, telemetry and state subsystems registered.
    pub async fn for_controller() -> Self {
        let checker = Self::new();
        for name in [SUBSYSTEM_MONITOR, SUBSYSTEM_TELEMETRY, SUBSYSTEM_STATE] {
            checker.register_subsystem(name).await;
        }
        checker
    }

    pub async fn register_subsystem(&self, name: &str) {
        let mut subsystems = self.subsystems.write().await;
        if subsystems.iter().any(|s| s.name == name) {
            return;
        }
        subsystems.push(SubsystemHealth {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        });
    }

    pub async fn update_subsystem(
        &self,
        name: &str,
        status: HealthStatus,
        message: Option<String>,
    ) {
        let mut subsystems = self.subsystems.write().await;
        if let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) {
            subsystem.status = status;
            subsystem.message = message;
        }
    }

    pub async fn mark_healthy(&self, name: &str) {
        self.update_subsystem(name, HealthStatus::Healthy, None).await;
    }

    /// Overall status is the worst subsystem status.
    pub async fn get_health(&self) -> HealthCheck {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck { status, version: env!("CARGO_PKG_VERSION").to_string(), subsystems }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
