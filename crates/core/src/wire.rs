//! Correlated request/response over one newline-delimited JSON socket.
//!
//! A [`WireConnection`] owns its socket through two background tasks. The
//! writer sends whole frames from a queue; the reader routes every response
//! to the caller waiting on its correlation id. A caller that gives up
//! (request timeout or a dropped future) only removes its own registration:
//! the late response is discarded and the connection stays usable.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Response frame carrying the id of the request it answers.
pub trait Correlated {
    fn correlation_id(&self) -> i64;
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("connection closed")]
    Closed,

    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("frame encoding failed: {0}")]
    Encode(String),
}

type Waiters<R> = HashMap<i64, oneshot::Sender<R>>;

struct Shared<R> {
    waiters: Mutex<Waiters<R>>,
    open: AtomicBool,
    cancel: CancellationToken,
}

impl<R> Shared<R> {
    fn lock(&self) -> MutexGuard<'_, Waiters<R>> {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop both tasks and fail every waiting caller with `Closed`.
    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.lock().clear();
    }
}

impl<R: Correlated> Shared<R> {
    fn route(&self, frame: R) {
        let correlation_id = frame.correlation_id();
        let waiter = self.lock().remove(&correlation_id);
        match waiter {
            Some(waiter) => {
                if waiter.send(frame).is_err() {
                    debug!(correlation_id, "caller gone, response discarded");
                }
            }
            None => debug!(correlation_id, "no caller waiting, response discarded"),
        }
    }
}

/// Removes a caller's registration when its `call` future finishes or is
/// dropped.
struct Registration<'a, R> {
    shared: &'a Shared<R>,
    correlation_id: i64,
}

impl<R> Drop for Registration<'_, R> {
    fn drop(&mut self) {
        self.shared.lock().remove(&self.correlation_id);
    }
}

/// Multiplexed client connection; `R` is the response frame type.
pub struct WireConnection<R> {
    peer: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared<R>>,
}

impl<R> WireConnection<R>
where
    R: Correlated + DeserializeOwned + Send + 'static,
{
    /// Take ownership of `stream` and start its reader and writer tasks.
    pub fn spawn(stream: TcpStream, peer: &str) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            waiters: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(write_loop(write_half, queue, Arc::clone(&shared)));
        tokio::spawn(read_loop(read_half, Arc::clone(&shared), peer.to_owned()));
        Self {
            peer: peer.to_owned(),
            outbound,
            shared,
        }
    }

    /// Send `frame` and wait up to `timeout` for the response carrying
    /// `correlation_id`.
    ///
    /// Dropping the returned future is safe: the frame is either written
    /// whole or not at all, and a late response is discarded.
    pub async fn call<Q: Serialize>(
        &self,
        correlation_id: i64,
        frame: &Q,
        timeout: Duration,
    ) -> Result<R, WireError> {
        let mut encoded =
            serde_json::to_vec(frame).map_err(|e| WireError::Encode(e.to_string()))?;
        encoded.push(b'\n');

        let (tx, rx) = oneshot::channel();
        self.shared.lock().insert(correlation_id, tx);
        let _registration = Registration {
            shared: &self.shared,
            correlation_id,
        };
        // Checked after registering: a shutdown that already cleared the
        // waiters has stored `open = false` first.
        if !self.is_open() || self.outbound.send(encoded).is_err() {
            return Err(WireError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(WireError::Closed),
            Err(_) => Err(WireError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl<R> WireConnection<R> {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Close the socket. Waiting callers fail with `Closed`. Idempotent.
    pub fn close(&self) {
        self.shared.shut();
    }
}

impl<R> Drop for WireConnection<R> {
    fn drop(&mut self) {
        self.shared.shut();
    }
}

impl<R> fmt::Debug for WireConnection<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireConnection")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("waiting", &self.shared.lock().len())
            .finish()
    }
}

async fn write_loop<R>(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared<R>>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "wire write failed");
            break;
        }
    }
    shared.shut();
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "socket shutdown failed");
    }
}

async fn read_loop<R>(reader: OwnedReadHalf, shared: Arc<Shared<R>>, peer: String)
where
    R: Correlated + DeserializeOwned,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(peer = %peer, "peer closed the connection");
                break;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "wire read failed");
                break;
            }
        };
        match serde_json::from_str::<R>(&line) {
            Ok(frame) => shared.route(frame),
            Err(e) => {
                warn!(peer = %peer, error = %e, "undecodable response frame, closing connection");
                break;
            }
        }
    }
    shared.shut();
}
