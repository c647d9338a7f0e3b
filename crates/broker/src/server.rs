//! Embedded broker server.
//!
//! # Lifecycle
//! ```text
//! NotRunning → Starting → RunningAsBroker
//!     → PendingControlledShutdown → ShuttingDown → NotRunning
//! ```
//!
//! Startup opens the broker's own coordination session, registers
//! `/brokers/ids/{id}` as an ephemeral node, elects itself controller and then
//! serves requests. Closing the session on shutdown is what removes the
//! registration. Like the coordination server, a broker is single-use.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use harness_coordination::client::CoordinationClient;
use harness_coordination::tree::CreateMode;
use harness_core::lifecycle::{EmbeddedService, HealthStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::admin::{AdminClient, to_json};
use crate::config::ServerConfig;
use crate::controller::{self, Controller};
use crate::error::BrokerError;
use crate::handler::RequestHandler;
use crate::metadata::{self, BrokerRegistration, now_ms};
use crate::offsets::OffsetStore;
use crate::protocol::{BrokerResponse, ErrorCode, MAX_FRAME_BYTES, RequestFrame, ResponseFrame};
use crate::replica::ReplicaManager;

/// Correlation id used when a request frame could not be parsed.
const UNPARSEABLE_CORRELATION_ID: i32 = -1;

/// Broker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    NotRunning,
    Starting,
    RunningAsBroker,
    PendingControlledShutdown,
    ShuttingDown,
}

impl BrokerState {
    fn as_u8(self) -> u8 {
        match self {
            Self::NotRunning => 0,
            Self::Starting => 1,
            Self::RunningAsBroker => 2,
            Self::PendingControlledShutdown => 3,
            Self::ShuttingDown => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::RunningAsBroker,
            3 => Self::PendingControlledShutdown,
            4 => Self::ShuttingDown,
            _ => Self::NotRunning,
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "not_running"),
            Self::Starting => write!(f, "starting"),
            Self::RunningAsBroker => write!(f, "running_as_broker"),
            Self::PendingControlledShutdown => write!(f, "pending_controlled_shutdown"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> BrokerState {
        BrokerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: BrokerState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: BrokerState, to: BrokerState) -> Result<(), BrokerState> {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(BrokerState::from_u8)
    }
}

/// Resources that exist only after a successful start.
#[derive(Debug)]
struct Runtime {
    coordination: Arc<CoordinationClient>,
    admin: AdminClient,
    replicas: Arc<ReplicaManager>,
}

/// Embedded single-node broker.
#[derive(Debug)]
pub struct Broker {
    config: ServerConfig,
    state: StateCell,
    serving: Arc<AtomicBool>,
    local_addr: OnceLock<SocketAddr>,
    runtime: OnceLock<Runtime>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    controller_cancel: CancellationToken,
    controller_tracker: TaskTracker,
}

impl Broker {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: StateCell::default(),
            serving: Arc::new(AtomicBool::new(false)),
            local_addr: OnceLock::new(),
            runtime: OnceLock::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            controller_cancel: CancellationToken::new(),
            controller_tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state.get()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn broker_id(&self) -> i32 {
        self.config.broker_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// `host:port` clients connect to.
    pub fn bootstrap_servers(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("{}:{}", self.config.host, addr.port()))
    }

    pub fn log_dirs(&self) -> &[PathBuf] {
        &self.config.log_dirs
    }

    /// Admin view over the broker's coordination session.
    pub fn admin(&self) -> Option<AdminClient> {
        self.runtime.get().map(|rt| rt.admin.clone())
    }

    /// Partitions this broker currently leads.
    pub fn leader_count(&self) -> usize {
        self.runtime.get().map_or(0, |rt| rt.replicas.leader_count())
    }

    /// Stop the controller loop and delete `/controller` if this broker holds
    /// it. Returns whether the role was released.
    pub async fn resign_controller(&self) -> Result<bool, BrokerError> {
        self.controller_cancel.cancel();
        self.controller_tracker.close();
        self.controller_tracker.wait().await;

        let Some(rt) = self.runtime.get() else {
            return Ok(false);
        };
        if !rt.coordination.is_connected() {
            return Ok(false);
        }
        controller::resign(&rt.admin, self.config.broker_id).await
    }

    /// Wait until the listener, every connection task and the controller
    /// loop have finished.
    pub async fn await_shutdown(&self) {
        self.tracker.close();
        self.controller_tracker.close();
        self.tracker.wait().await;
        self.controller_tracker.wait().await;
    }

    async fn bring_up(&self) -> Result<SocketAddr, BrokerError> {
        for dir in &self.config.log_dirs {
            tokio::fs::create_dir_all(dir).await?;
        }

        let coordination = Arc::new(
            CoordinationClient::connect(
                &self.config.coordination_connect,
                self.config.coordination_connection_timeout,
                self.config.coordination_session_timeout,
            )
            .await?,
        );
        match self.serve(&coordination).await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                self.controller_cancel.cancel();
                self.cancel.cancel();
                coordination.close().await;
                Err(e)
            }
        }
    }

    async fn serve(&self, coordination: &Arc<CoordinationClient>) -> Result<SocketAddr, BrokerError> {
        for path in metadata::BASE_PATHS {
            match coordination.create(path, "", CreateMode::Persistent).await {
                Ok(_) => {}
                Err(e) if e.is_node_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        if self.local_addr.set(addr).is_err() {
            return Err(BrokerError::AlreadyStarted);
        }

        let registration = BrokerRegistration::new(&self.config.host, addr.port(), now_ms());
        match coordination
            .create(
                &metadata::broker_path(self.config.broker_id),
                &to_json(&registration)?,
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_node_exists() => {
                return Err(BrokerError::Config {
                    field: "broker_id".to_owned(),
                    reason: format!("broker {} is already registered", self.config.broker_id),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let admin = AdminClient::new(Arc::clone(coordination));
        let replicas = Arc::new(ReplicaManager::new(self.config.log_dirs.clone()));
        match Controller::elect(
            admin.clone(),
            self.config.broker_id,
            Arc::clone(&replicas),
            self.config.controller_poll_interval,
        )
        .await?
        {
            Some(controller) => {
                self.controller_tracker
                    .spawn(controller.run(self.controller_cancel.clone()));
            }
            None => info!(broker_id = self.config.broker_id, "another broker is controller"),
        }

        // Auto-created topics cannot ask for more replicas than there are brokers.
        let live = admin.live_brokers().await?.len().max(1);
        let auto_create = self.config.auto_create_topics.then(|| {
            let rf = i16::try_from(live).unwrap_or(i16::MAX);
            (
                self.config.num_partitions,
                self.config.default_replication_factor.clamp(1, rf),
            )
        });
        let handler = Arc::new(RequestHandler::new(
            self.config.broker_id,
            admin.clone(),
            Arc::clone(&replicas),
            Arc::new(OffsetStore::new()),
            auto_create,
        ));

        if self
            .runtime
            .set(Runtime {
                coordination: Arc::clone(coordination),
                admin,
                replicas,
            })
            .is_err()
        {
            return Err(BrokerError::AlreadyStarted);
        }

        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        self.serving.store(true, Ordering::Release);
        self.tracker.spawn(accept_loop(
            listener,
            handler,
            permits,
            self.cancel.clone(),
            self.tracker.clone(),
            Arc::clone(&self.serving),
        ));
        Ok(addr)
    }
}

impl EmbeddedService for Broker {
    type Error = BrokerError;

    fn name(&self) -> &str {
        "broker"
    }

    async fn start(&self) -> Result<(), BrokerError> {
        if self.local_addr.get().is_some() {
            return Err(BrokerError::AlreadyStarted);
        }
        self.config.validate()?;
        self.state
            .transition(BrokerState::NotRunning, BrokerState::Starting)
            .map_err(|_| BrokerError::AlreadyStarted)?;

        match self.bring_up().await {
            Ok(addr) => {
                self.state.set(BrokerState::RunningAsBroker);
                info!(
                    broker_id = self.config.broker_id,
                    addr = %addr,
                    coordination = %self.config.coordination_connect,
                    log_dirs = self.config.log_dirs.len(),
                    "broker started"
                );
                Ok(())
            }
            Err(e) => {
                self.serving.store(false, Ordering::Release);
                self.state.set(BrokerState::NotRunning);
                Err(e)
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.state.get() == BrokerState::RunningAsBroker && self.serving.load(Ordering::Acquire)
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        let from = BrokerState::RunningAsBroker;
        let next = if self.config.controlled_shutdown {
            BrokerState::PendingControlledShutdown
        } else {
            BrokerState::ShuttingDown
        };
        if self.state.transition(from, next).is_err() {
            debug!(state = %self.state.get(), "broker not running, nothing to stop");
            return Ok(());
        }
        info!(broker_id = self.config.broker_id, "broker shutting down");

        let mut first_error = None;
        if next == BrokerState::PendingControlledShutdown {
            if let Err(e) = self.resign_controller().await {
                warn!(error = %e, "controller resignation failed");
                first_error.get_or_insert(e);
            }
            self.state.set(BrokerState::ShuttingDown);
        }

        self.controller_cancel.cancel();
        self.cancel.cancel();
        self.await_shutdown().await;
        self.serving.store(false, Ordering::Release);

        if let Some(rt) = self.runtime.get() {
            rt.coordination.close().await;
            let failed = rt.replicas.flush_all();
            if failed > 0 {
                first_error.get_or_insert(BrokerError::Io(std::io::Error::other(format!(
                    "{failed} partition logs failed to flush"
                ))));
            }
            rt.replicas.clear();
        }

        self.state.set(BrokerState::NotRunning);
        info!(broker_id = self.config.broker_id, "broker stopped");
        first_error.map_or(Ok(()), Err)
    }

    fn abort(&self) {
        self.controller_cancel.cancel();
        self.cancel.cancel();
        self.controller_tracker.close();
        self.tracker.close();
        self.serving.store(false, Ordering::Release);
        self.state.set(BrokerState::NotRunning);
    }

    fn health_check(&self) -> HealthStatus {
        match self.state.get() {
            BrokerState::RunningAsBroker => match self.runtime.get() {
                Some(rt) if !rt.coordination.is_connected() => {
                    HealthStatus::Degraded("coordination session lost".to_owned())
                }
                _ if !self.serving.load(Ordering::Acquire) => {
                    HealthStatus::Unhealthy("listener stopped".to_owned())
                }
                _ => HealthStatus::Healthy,
            },
            state => HealthStatus::Unhealthy(format!("broker is {state}")),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    serving: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "broker accept failed");
                        continue;
                    }
                };
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    warn!(%peer, "max connections reached, rejecting connection");
                    continue;
                };
                debug!(%peer, "broker client connected");
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    if let Err(e) = handle_connection(stream, &handler, &cancel).await {
                        debug!(%peer, error = %e, "broker connection ended with error");
                    }
                    drop(permit);
                });
            }
        }
    }
    serving.store(false, Ordering::Release);
    debug!("broker accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    handler: &RequestHandler,
    cancel: &CancellationToken,
) -> Result<(), BrokerError> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = if line.len() > MAX_FRAME_BYTES {
            invalid(format!("request exceeds {MAX_FRAME_BYTES} bytes"))
        } else {
            match serde_json::from_str::<RequestFrame>(&line) {
                Ok(frame) => ResponseFrame {
                    correlation_id: frame.correlation_id,
                    response: handler.handle(frame.request).await,
                },
                Err(e) => invalid(e.to_string()),
            }
        };

        let mut encoded =
            serde_json::to_vec(&response).map_err(|e| BrokerError::Protocol(e.to_string()))?;
        encoded.push(b'\n');
        write_half.write_all(&encoded).await?;
    }
}

fn invalid(message: String) -> ResponseFrame {
    ResponseFrame {
        correlation_id: UNPARSEABLE_CORRELATION_ID,
        response: BrokerResponse::Error {
            error_code: ErrorCode::InvalidRequest,
            message,
        },
    }
}
