//! Coordination client session.
//!
//! One TCP connection, one server session. Requests travel over a
//! [`WireConnection`], so several may be in flight and a caller that stops
//! waiting does not disturb the others.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use harness_core::wire::WireConnection;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::CoordinationError;
use crate::protocol::{Reply, Request, RequestFrame, ResponseFrame};
use crate::tree::{CreateMode, Stat};

/// Session to the embedded coordination service.
#[derive(Debug)]
pub struct CoordinationClient {
    addr: String,
    session_id: i64,
    session_timeout: Duration,
    request_timeout: Duration,
    next_xid: AtomicI64,
    wire: WireConnection<ResponseFrame>,
}

impl CoordinationClient {
    /// Connect and open a session.
    ///
    /// `connection_timeout` bounds the TCP connect and the handshake;
    /// `session_timeout` is the requested session timeout (the server clamps
    /// it) and also bounds every later request.
    pub async fn connect(
        addr: &str,
        connection_timeout: Duration,
        session_timeout: Duration,
    ) -> Result<Self, CoordinationError> {
        let connect_timeout = || CoordinationError::ConnectTimeout {
            addr: addr.to_owned(),
            timeout_ms: millis(connection_timeout),
        };
        let stream = tokio::time::timeout(connection_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| connect_timeout())??;
        stream.set_nodelay(true)?;

        let mut client = Self {
            addr: addr.to_owned(),
            session_id: 0,
            session_timeout,
            request_timeout: connection_timeout,
            next_xid: AtomicI64::new(1),
            wire: WireConnection::spawn(stream, addr),
        };

        let requested_ms = millis(session_timeout);
        match client
            .call(Request::Connect {
                session_timeout_ms: requested_ms,
            })
            .await?
        {
            Reply::Connected {
                session_id,
                timeout_ms,
            } => {
                client.session_id = session_id;
                client.session_timeout = Duration::from_millis(timeout_ms);
                client.request_timeout = client.session_timeout;
            }
            other => return Err(unexpected(&other)),
        }

        debug!(
            addr,
            session_id = client.session_id,
            negotiated_timeout_ms = millis(client.session_timeout),
            "coordination session established"
        );
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Session timeout negotiated with the server.
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.wire.is_open()
    }

    /// Create a node; returns the actual path (differs for sequential modes).
    pub async fn create(
        &self,
        path: &str,
        data: &str,
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        match self
            .call(Request::Create {
                path: path.to_owned(),
                data: data.to_owned(),
                mode,
            })
            .await?
        {
            Reply::Created { path } => Ok(path),
            other => Err(unexpected(&other)),
        }
    }

    /// Create `path`, first creating any missing ancestors as empty
    /// persistent nodes.
    pub async fn create_recursive(
        &self,
        path: &str,
        data: &str,
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        for ancestor in ancestors(path) {
            match self.create(ancestor, "", CreateMode::Persistent).await {
                Ok(_) => {}
                Err(e) if e.is_node_exists() => {}
                Err(e) => return Err(e),
            }
        }
        self.create(path, data, mode).await
    }

    pub async fn get_data(&self, path: &str) -> Result<(String, Stat), CoordinationError> {
        match self
            .call(Request::GetData {
                path: path.to_owned(),
            })
            .await?
        {
            Reply::Data { data, stat } => Ok((data, stat)),
            other => Err(unexpected(&other)),
        }
    }

    /// Like [`get_data`](Self::get_data) but maps a missing node to `None`.
    pub async fn get_data_opt(
        &self,
        path: &str,
    ) -> Result<Option<(String, Stat)>, CoordinationError> {
        match self.get_data(path).await {
            Ok(found) => Ok(Some(found)),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace node data; `version` of `None` skips the version check.
    pub async fn set_data(
        &self,
        path: &str,
        data: &str,
        version: Option<i32>,
    ) -> Result<Stat, CoordinationError> {
        match self
            .call(Request::SetData {
                path: path.to_owned(),
                data: data.to_owned(),
                version,
            })
            .await?
        {
            Reply::Exists { stat: Some(stat) } => Ok(stat),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<Option<Stat>, CoordinationError> {
        match self
            .call(Request::Exists {
                path: path.to_owned(),
            })
            .await?
        {
            Reply::Exists { stat } => Ok(stat),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        match self
            .call(Request::GetChildren {
                path: path.to_owned(),
            })
            .await?
        {
            Reply::Children { children } => Ok(children),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError> {
        match self
            .call(Request::Delete {
                path: path.to_owned(),
                version,
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Delete `path` and everything below it. A missing node is not an error.
    pub async fn delete_recursive(&self, path: &str) -> Result<(), CoordinationError> {
        // Depth-first, iterative: collect the subtree, then delete leaves first.
        let mut pending = vec![path.to_owned()];
        let mut ordered = Vec::new();
        while let Some(current) = pending.pop() {
            let children = match self.get_children(&current).await {
                Ok(children) => children,
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e),
            };
            for child in children {
                pending.push(join(&current, &child));
            }
            ordered.push(current);
        }
        for node in ordered.iter().rev() {
            match self.delete(node, None).await {
                Ok(()) => {}
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Round-trip liveness check.
    pub async fn ping(&self) -> Result<(), CoordinationError> {
        match self.call(Request::Ping).await? {
            Reply::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Close the session. Ephemeral nodes of the session are removed by the
    /// server. Safe to call more than once.
    pub async fn close(&self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.call(Request::Close).await {
            debug!(session_id = self.session_id, error = %e, "close request failed");
        }
        self.wire.close();
        debug!(session_id = self.session_id, "coordination session closed");
    }

    async fn call(&self, request: Request) -> Result<Reply, CoordinationError> {
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        let op = request.name();
        let response = self
            .wire
            .call(xid, &RequestFrame { xid, request }, self.request_timeout)
            .await
            .map_err(|e| {
                debug!(op, xid, error = %e, "coordination request failed");
                CoordinationError::from(e)
            })?;
        response.result.map_err(CoordinationError::from)
    }
}

fn unexpected(reply: &Reply) -> CoordinationError {
    CoordinationError::Protocol(format!("unexpected reply: {reply:?}"))
}

/// Proper ancestors of an absolute path, shallowest first (`/` excluded).
fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('/')
        .map(|(idx, _)| idx)
        .filter(|&idx| idx > 0)
        .map(|idx| &path[..idx])
        .collect()
}

fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
