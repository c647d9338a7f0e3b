//! Coordination service handle.
//!
//! [`CoordinationServiceHandle`] owns one embedded [`CoordinationServer`]
//! bound to the configured host/port and data directory. Every `start()`
//! from `Stopped` launches a fresh server instance.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use harness_coordination::CoordinationServer;
use harness_core::{
    CoordinationConfig, EmbeddedService, HarnessError, HealthStatus, LifecycleCell,
    LifecycleState, ResourceSlot,
};

/// Start/stop wrapper around the embedded coordination service.
#[derive(Debug)]
pub struct CoordinationServiceHandle {
    config: CoordinationConfig,
    state: LifecycleCell,
    server: ResourceSlot<CoordinationServer>,
}

impl CoordinationServiceHandle {
    pub fn new(config: CoordinationConfig) -> Self {
        Self {
            config,
            state: LifecycleCell::new(),
            server: ResourceSlot::empty("coordination-server"),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir_path()
    }

    /// Launch the service. A call while not `Stopped` is a no-op.
    pub async fn start(&self) -> Result<(), HarnessError> {
        if let Err(current) = self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            debug!(state = %current, "coordination service already started, ignoring start");
            return Ok(());
        }

        let server = match self.server.try_set(CoordinationServer::new(self.config.clone())) {
            Ok(server) => server,
            Err((_, existing)) => {
                self.state.set(LifecycleState::Stopped);
                return Err(HarnessError::illegal_state(format!(
                    "coordination server {} is still registered",
                    existing.connect_string().unwrap_or_default()
                )));
            }
        };

        match server.start().await {
            Ok(()) => {
                self.state.set(LifecycleState::Running);
                info!(
                    connect = %server.connect_string().unwrap_or_default(),
                    "coordination handle running"
                );
                Ok(())
            }
            Err(e) => {
                self.server.take();
                self.state.set(LifecycleState::Stopped);
                Err(e.into())
            }
        }
    }

    /// `true` once the server's listener is bound and its accept loop alive.
    pub fn is_running(&self) -> bool {
        self.server.get().is_some_and(|server| server.is_ready())
    }

    /// `host:port` of the bound endpoint.
    pub fn connect_string(&self) -> Option<String> {
        self.server.get().and_then(|server| server.connect_string())
    }

    pub fn health(&self) -> HealthStatus {
        match self.server.get() {
            Some(server) => server.health_check(),
            None => HealthStatus::Unhealthy("coordination service not started".to_owned()),
        }
    }

    /// Stop the service and remove its data directory. Safe if never started.
    pub async fn shutdown(&self) -> Result<(), HarnessError> {
        self.state.set(LifecycleState::Stopping);
        let stopped = match self.server.take() {
            Some(server) => server.shutdown().await.map_err(HarnessError::from),
            None => Ok(()),
        };
        let removed = remove_dir(&self.config.data_dir_path()).await;
        self.state.set(LifecycleState::Stopped);
        stopped.and(removed)
    }

    /// Synchronous best-effort stop for `Drop` paths.
    pub fn abort(&self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
        let dir = self.config.data_dir_path();
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to remove coordination data dir");
            }
        }
        self.state.set(LifecycleState::Stopped);
    }
}

impl Drop for CoordinationServiceHandle {
    fn drop(&mut self) {
        if self.server.is_present() {
            self.abort();
        }
    }
}

/// Remove `dir` recursively; a missing directory is not an error.
pub(crate) async fn remove_dir(dir: &Path) -> Result<(), HarnessError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            debug!(dir = %dir.display(), "directory removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
