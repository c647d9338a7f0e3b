//! Lifecycle state and health reporting shared by the embedded services.
//!
//! # Lifecycle
//! ```text
//! Stopped → start() → Starting → Running → shutdown() → Stopping → Stopped
//! ```
//!
//! [`LifecycleCell`] stores the state atomically and only moves it through
//! compare-and-set transitions, so concurrent `start()`/`shutdown()` calls
//! cannot both win the same transition.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle of one managed component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Atomic holder for a [`LifecycleState`].
#[derive(Debug)]
pub struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: LifecycleState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Move `from → to` only if the current state is `from`.
    ///
    /// Returns `Err(current)` when another caller got there first.
    pub fn transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), LifecycleState> {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Component health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// Start/stop/query contract of an embedded service.
///
/// The harness drives the coordination service and the broker only through
/// this trait; their internals stay behind it.
pub trait EmbeddedService: Send + Sync {
    /// Error produced by `start`/`shutdown`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short name for logs and health reports.
    fn name(&self) -> &str;

    /// Bring the service up. Returns once listeners are bound.
    fn start(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// `true` once the service accepts client requests.
    fn is_ready(&self) -> bool;

    /// Stop the service and wait for its tasks to finish.
    fn shutdown(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Synchronous best-effort stop used from `Drop`.
    fn abort(&self);

    fn health_check(&self) -> HealthStatus {
        if self.is_ready() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy(format!("{} not serving", self.name()))
        }
    }
}
