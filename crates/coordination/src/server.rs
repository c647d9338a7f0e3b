//! Embedded coordination server.
//!
//! Binds a TCP listener, accepts connections up to `max_client_connections`,
//! and serves newline-delimited JSON requests against one shared
//! [`ZNodeTree`]. Each connection is handled in its own task; all tasks are
//! tracked so [`shutdown`](EmbeddedService::shutdown) can wait for them.
//!
//! A server instance is single-use: once stopped it cannot be started again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use harness_core::config::CoordinationConfig;
use harness_core::lifecycle::{EmbeddedService, LifecycleCell, LifecycleState};
use harness_core::metrics as m;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, NodeError};
use crate::protocol::{
    MAX_FRAME_BYTES, Reply, Request, RequestFrame, ResponseFrame, UNPARSEABLE_XID,
};
use crate::tree::ZNodeTree;
use crate::txn_log::{TxnEntry, TxnLog, TxnOp};

/// Smallest negotiated session timeout, in ticks.
const MIN_SESSION_TICKS: u64 = 2;
/// Largest negotiated session timeout, in ticks.
const MAX_SESSION_TICKS: u64 = 20;

/// Clamp a requested session timeout to `[2, 20]` ticks.
pub fn negotiate_session_timeout(requested_ms: u64, tick_time_ms: u64) -> u64 {
    requested_ms.clamp(
        MIN_SESSION_TICKS * tick_time_ms,
        MAX_SESSION_TICKS * tick_time_ms,
    )
}

#[derive(Debug)]
struct Database {
    tree: ZNodeTree,
    log: TxnLog,
    sessions: HashMap<i64, u64>,
}

impl Database {
    fn record(&mut self, session_id: i64, op: TxnOp) {
        let entry = TxnEntry {
            zxid: self.tree.last_zxid(),
            session_id,
            op,
        };
        if let Err(e) = self.log.append(&entry) {
            warn!(path = %self.log.path().display(), error = %e, "failed to append transaction log entry");
        }
    }

    fn close_session(&mut self, session_id: i64) -> Vec<String> {
        let removed = self.tree.close_session(session_id);
        if self.sessions.remove(&session_id).is_some() {
            self.record(
                session_id,
                TxnOp::CloseSession {
                    removed: removed.clone(),
                },
            );
        }
        metrics::gauge!(m::COORDINATION_OPEN_SESSIONS).set(self.sessions.len() as f64);
        removed
    }
}

/// State shared by the accept loop and every connection task.
#[derive(Debug)]
struct Shared {
    db: Mutex<Database>,
    next_session_id: AtomicI64,
    tick_time_ms: u64,
}

impl Shared {
    fn db(&self) -> MutexGuard<'_, Database> {
        // Every mutation completes before the guard is released, so a
        // poisoned lock still guards a consistent tree.
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply one request. `session` is the connection's session, if opened.
    fn handle(&self, session: &mut Option<i64>, frame: RequestFrame) -> ResponseFrame {
        let op = frame.request.name();
        metrics::counter!(m::COORDINATION_REQUESTS_TOTAL, m::LABEL_OP => op).increment(1);

        let mut db = self.db();
        let result = match (frame.request, *session) {
            (Request::Connect { session_timeout_ms }, None) => {
                let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = negotiate_session_timeout(session_timeout_ms, self.tick_time_ms);
                db.sessions.insert(session_id, timeout_ms);
                db.record(session_id, TxnOp::CreateSession { timeout_ms });
                metrics::gauge!(m::COORDINATION_OPEN_SESSIONS).set(db.sessions.len() as f64);
                *session = Some(session_id);
                debug!(session_id, timeout_ms, "session opened");
                Ok(Reply::Connected {
                    session_id,
                    timeout_ms,
                })
            }
            (Request::Connect { .. }, Some(_)) => Err(NodeError::Malformed {
                reason: "session already established on this connection".to_owned(),
            }),
            (_, None) => Err(NodeError::SessionRequired),
            (request, Some(session_id)) => apply(&mut db, session_id, request, session),
        };

        ResponseFrame {
            xid: frame.xid,
            zxid: db.tree.last_zxid(),
            result,
        }
    }

    fn close_session(&self, session_id: i64) {
        let removed = self.db().close_session(session_id);
        debug!(session_id, ephemerals_removed = removed.len(), "session closed");
    }
}

fn apply(
    db: &mut Database,
    session_id: i64,
    request: Request,
    session: &mut Option<i64>,
) -> Result<Reply, NodeError> {
    match request {
        Request::Ping => Ok(Reply::Pong),
        Request::Create { path, data, mode } => {
            let created = db.tree.create(&path, &data, mode, session_id)?;
            db.record(
                session_id,
                TxnOp::Create {
                    path: created.clone(),
                    data,
                    mode,
                },
            );
            Ok(Reply::Created { path: created })
        }
        Request::GetData { path } => {
            let (data, stat) = db.tree.get_data(&path)?;
            Ok(Reply::Data { data, stat })
        }
        Request::SetData {
            path,
            data,
            version,
        } => {
            let stat = db.tree.set_data(&path, &data, version)?;
            db.record(
                session_id,
                TxnOp::SetData {
                    path,
                    data,
                    version: stat.version,
                },
            );
            Ok(Reply::Exists { stat: Some(stat) })
        }
        Request::Exists { path } => Ok(Reply::Exists {
            stat: db.tree.exists(&path),
        }),
        Request::GetChildren { path } => Ok(Reply::Children {
            children: db.tree.get_children(&path)?,
        }),
        Request::Delete { path, version } => {
            db.tree.delete(&path, version)?;
            db.record(session_id, TxnOp::Delete { path });
            Ok(Reply::Done)
        }
        Request::Close => {
            db.close_session(session_id);
            *session = None;
            Ok(Reply::Done)
        }
        Request::Connect { .. } => Err(NodeError::Malformed {
            reason: "unexpected connect".to_owned(),
        }),
    }
}

/// Embedded single-node coordination service.
#[derive(Debug)]
pub struct CoordinationServer {
    config: CoordinationConfig,
    state: LifecycleCell,
    serving: Arc<AtomicBool>,
    local_addr: OnceLock<SocketAddr>,
    shared: OnceLock<Arc<Shared>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl CoordinationServer {
    pub fn new(config: CoordinationConfig) -> Self {
        Self {
            config,
            state: LifecycleCell::new(),
            serving: Arc::new(AtomicBool::new(false)),
            local_addr: OnceLock::new(),
            shared: OnceLock::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Bound client endpoint, available after a successful start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// `host:port` of the bound endpoint.
    pub fn connect_string(&self) -> Option<String> {
        self.local_addr().map(|addr| addr.to_string())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir_path()
    }

    /// Open sessions.
    pub fn session_count(&self) -> usize {
        self.shared.get().map_or(0, |shared| shared.db().sessions.len())
    }

    /// Nodes in the tree, including `/`.
    pub fn node_count(&self) -> usize {
        self.shared.get().map_or(0, |shared| shared.db().tree.len())
    }

    async fn bind(&self) -> Result<SocketAddr, CoordinationError> {
        let data_dir = self.config.data_dir_path();
        tokio::fs::create_dir_all(&data_dir).await?;
        let log = TxnLog::open(&data_dir)?;

        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.client_port)).await?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            db: Mutex::new(Database {
                tree: ZNodeTree::new(),
                log,
                sessions: HashMap::new(),
            }),
            next_session_id: AtomicI64::new(1),
            tick_time_ms: self.config.tick_time_ms,
        });
        if self.shared.set(Arc::clone(&shared)).is_err() || self.local_addr.set(addr).is_err() {
            return Err(CoordinationError::AlreadyStarted);
        }

        let permits = Arc::new(Semaphore::new(self.config.max_client_connections));
        self.serving.store(true, Ordering::Release);
        self.tracker.spawn(accept_loop(
            listener,
            shared,
            permits,
            self.cancel.clone(),
            self.tracker.clone(),
            Arc::clone(&self.serving),
        ));
        Ok(addr)
    }
}

impl EmbeddedService for CoordinationServer {
    type Error = CoordinationError;

    fn name(&self) -> &str {
        "coordination"
    }

    async fn start(&self) -> Result<(), CoordinationError> {
        if self.local_addr.get().is_some() {
            return Err(CoordinationError::AlreadyStarted);
        }
        self.state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
            .map_err(|_| CoordinationError::AlreadyStarted)?;

        match self.bind().await {
            Ok(addr) => {
                self.state.set(LifecycleState::Running);
                info!(
                    addr = %addr,
                    data_dir = %self.config.data_dir,
                    tick_time_ms = self.config.tick_time_ms,
                    "coordination service started"
                );
                Ok(())
            }
            Err(e) => {
                self.cancel.cancel();
                self.serving.store(false, Ordering::Release);
                self.state.set(LifecycleState::Stopped);
                Err(e)
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.state.get() == LifecycleState::Running && self.serving.load(Ordering::Acquire)
    }

    async fn shutdown(&self) -> Result<(), CoordinationError> {
        if self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
            .is_err()
        {
            debug!(state = %self.state.get(), "coordination service not running, nothing to stop");
            return Ok(());
        }

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.serving.store(false, Ordering::Release);

        let synced = match self.shared.get() {
            Some(shared) => shared.db().log.sync(),
            None => Ok(()),
        };
        self.state.set(LifecycleState::Stopped);
        info!("coordination service stopped");
        synced.map_err(CoordinationError::from)
    }

    fn abort(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.serving.store(false, Ordering::Release);
        self.state.set(LifecycleState::Stopped);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
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
                        warn!(error = %e, "coordination accept failed");
                        continue;
                    }
                };
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    warn!(%peer, "max client connections reached, rejecting connection");
                    continue;
                };
                debug!(%peer, "coordination client connected");
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    if let Err(e) = handle_connection(stream, &shared, &cancel).await {
                        debug!(%peer, error = %e, "coordination connection ended with error");
                    }
                    drop(permit);
                });
            }
        }
    }
    serving.store(false, Ordering::Release);
    debug!("coordination accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    shared: &Shared,
    cancel: &CancellationToken,
) -> Result<(), CoordinationError> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut session: Option<i64> = None;

    let outcome = loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(CoordinationError::Io(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let (response, closing) = if line.len() > MAX_FRAME_BYTES {
            (
                malformed(format!("request exceeds {MAX_FRAME_BYTES} bytes")),
                false,
            )
        } else {
            match serde_json::from_str::<RequestFrame>(&line) {
                Ok(frame) => {
                    let closing = session.is_some() && frame.request == Request::Close;
                    (shared.handle(&mut session, frame), closing)
                }
                Err(e) => (malformed(e.to_string()), false),
            }
        };

        let mut encoded = match serde_json::to_vec(&response) {
            Ok(encoded) => encoded,
            Err(e) => break Err(CoordinationError::Protocol(e.to_string())),
        };
        encoded.push(b'\n');
        if let Err(e) = write_half.write_all(&encoded).await {
            break Err(CoordinationError::Io(e));
        }
        if closing {
            break Ok(());
        }
    };

    if let Some(session_id) = session {
        shared.close_session(session_id);
    }
    outcome
}

fn malformed(reason: String) -> ResponseFrame {
    ResponseFrame {
        xid: UNPARSEABLE_XID,
        zxid: 0,
        result: Err(NodeError::Malformed { reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CoordinationClient;
    use crate::tree::CreateMode;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> CoordinationConfig {
        CoordinationConfig {
            data_dir: dir.display().to_string(),
            ..CoordinationConfig::default()
        }
    }

    async fn started(dir: &std::path::Path) -> CoordinationServer {
        let server = CoordinationServer::new(config(dir));
        server.start().await.unwrap();
        server
    }

    async fn client(server: &CoordinationServer) -> CoordinationClient {
        CoordinationClient::connect(
            &server.connect_string().unwrap(),
            Duration::from_secs(5),
            Duration::from_secs(6),
        )
        .await
        .unwrap()
    }

    #[test]
    fn session_timeout_is_clamped_to_tick_window() {
        assert_eq!(negotiate_session_timeout(100, 500), 1_000);
        assert_eq!(negotiate_session_timeout(6_000, 500), 6_000);
        assert_eq!(negotiate_session_timeout(60_000, 500), 10_000);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_reports_ready() {
        let dir = tempfile::tempdir().unwrap();
        let server = started(dir.path()).await;

        assert!(server.is_ready());
        assert_eq!(server.state(), LifecycleState::Running);
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(dir.path().join("version-2").join("log.1").exists());

        server.shutdown().await.unwrap();
        assert!(!server.is_ready());
        assert_eq!(server.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn server_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let server = started(dir.path()).await;
        assert!(matches!(
            server.start().await,
            Err(CoordinationError::AlreadyStarted)
        ));
        server.shutdown().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(CoordinationError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let server = CoordinationServer::new(config(dir.path()));
        server.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
        assert_eq!(server.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn ephemerals_disappear_when_session_closes() {
        let dir = tempfile::tempdir().unwrap();
        let server = started(dir.path()).await;
        let owner = client(&server).await;
        let observer = client(&server).await;

        owner
            .create("/controller", r#"{"brokerid":0}"#, CreateMode::Ephemeral)
            .await
            .unwrap();
        assert!(observer.exists("/controller").await.unwrap().is_some());
        assert_eq!(server.session_count(), 2);

        owner.close().await;
        // The server handles the close before answering it.
        assert!(observer.exists("/controller").await.unwrap().is_none());
        assert_eq!(server.session_count(), 1);

        observer.close().await;
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_releases_ephemerals() {
        let dir = tempfile::tempdir().unwrap();
        let server = started(dir.path()).await;
        let observer = client(&server).await;
        {
            let owner = client(&server).await;
            owner
                .create("/brokers", "", CreateMode::Persistent)
                .await
                .unwrap();
            owner
                .create("/brokers/0", "{}", CreateMode::Ephemeral)
                .await
                .unwrap();
        }

        let mut gone = false;
        for _ in 0..50 {
            if observer.exists("/brokers/0").await.unwrap().is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "ephemeral node survived a dropped connection");
        assert!(observer.exists("/brokers").await.unwrap().is_some());

        observer.close().await;
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn mutations_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let server = started(dir.path()).await;
        let session = client(&server).await;
        session
            .create("/a", "1", CreateMode::Persistent)
            .await
            .unwrap();
        session.set_data("/a", "2", Some(0)).await.unwrap();
        session.delete("/a", None).await.unwrap();
        session.close().await;
        server.shutdown().await.unwrap();

        let entries =
            crate::txn_log::read_entries(&dir.path().join("version-2").join("log.1")).unwrap();
        let kinds: Vec<_> = entries
            .iter()
            .map(|entry| match entry.op {
                TxnOp::CreateSession { .. } => "create_session",
                TxnOp::CloseSession { .. } => "close_session",
                TxnOp::Create { .. } => "create",
                TxnOp::SetData { .. } => "set_data",
                TxnOp::Delete { .. } => "delete",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["create_session", "create", "set_data", "delete", "close_session"]
        );
    }

    #[tokio::test]
    async fn requests_before_connect_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = started(dir.path()).await;

        let mut stream = TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();
        stream
            .write_all(b"{\"xid\":1,\"request\":{\"op\":\"ping\"}}\nnot json\n")
            .await
            .unwrap();
        let mut lines = BufReader::new(&mut stream).lines();

        let first: ResponseFrame =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.xid, 1);
        assert_eq!(first.result, Err(NodeError::SessionRequired));

        let second: ResponseFrame =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.xid, UNPARSEABLE_XID);
        assert!(matches!(second.result, Err(NodeError::Malformed { .. })));

        server.shutdown().await.unwrap();
    }
}
