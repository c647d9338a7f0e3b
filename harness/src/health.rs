//! Aggregated health reporting.
//!
//! The overall harness status is the worst status among its components:
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reason)
//! - Any Unhealthy -> Unhealthy(reason)

use serde::Serialize;

use harness_core::{HealthStatus, LifecycleState};

/// Health report for a whole harness.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessHealth {
    /// Lifecycle state at the time of the report.
    pub state: String,
    /// Worst status of all components.
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HarnessHealth {
    pub fn new(state: LifecycleState, components: Vec<ComponentHealth>) -> Self {
        let status = match state {
            LifecycleState::Running => aggregate_status(&components),
            other => HealthStatus::Unhealthy(format!("harness is {other}")),
        };
        Self {
            state: state.to_string(),
            status,
            components,
        }
    }
}

/// Health of one embedded component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// e.g. "coordination", "broker", "producer"
    pub name: String,
    pub status: HealthStatus,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

/// Worst status found: Unhealthy > Degraded > Healthy.
pub fn aggregate_status(components: &[ComponentHealth]) -> HealthStatus {
    let mut worst = HealthStatus::Healthy;
    let mut reasons = Vec::new();

    for component in components {
        match &component.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                if !worst.is_unhealthy() {
                    reasons.push(format!("{}: {}", component.name, reason));
                    worst = HealthStatus::Degraded(String::new());
                }
            }
            HealthStatus::Unhealthy(reason) => {
                if !worst.is_unhealthy() {
                    reasons.clear();
                }
                reasons.push(format!("{}: {}", component.name, reason));
                worst = HealthStatus::Unhealthy(String::new());
            }
        }
    }

    match worst {
        HealthStatus::Healthy => HealthStatus::Healthy,
        HealthStatus::Degraded(_) => HealthStatus::Degraded(reasons.join("; ")),
        HealthStatus::Unhealthy(_) => HealthStatus::Unhealthy(reasons.join("; ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, status: HealthStatus) -> ComponentHealth {
        ComponentHealth::new(name, status)
    }

    #[test]
    fn all_healthy() {
        let components = vec![
            component("coordination", HealthStatus::Healthy),
            component("broker", HealthStatus::Healthy),
        ];
        assert!(aggregate_status(&components).is_healthy());
    }

    #[test]
    fn empty_is_healthy() {
        assert!(aggregate_status(&[]).is_healthy());
    }

    #[test]
    fn degraded_collects_reasons() {
        let components = vec![
            component("coordination", HealthStatus::Healthy),
            component("producer", HealthStatus::Degraded("closed".to_owned())),
        ];
        assert_eq!(
            aggregate_status(&components),
            HealthStatus::Degraded("producer: closed".to_owned())
        );
    }

    #[test]
    fn unhealthy_wins_and_drops_degraded_reasons() {
        let components = vec![
            component("producer", HealthStatus::Degraded("closed".to_owned())),
            component("broker", HealthStatus::Unhealthy("not serving".to_owned())),
            component("coordination", HealthStatus::Unhealthy("down".to_owned())),
        ];
        assert_eq!(
            aggregate_status(&components),
            HealthStatus::Unhealthy("broker: not serving; coordination: down".to_owned())
        );
    }

    #[test]
    fn stopped_harness_is_unhealthy() {
        let health = HarnessHealth::new(LifecycleState::Stopped, Vec::new());
        assert!(health.status.is_unhealthy());
        assert_eq!(health.state, "stopped");
    }
}
