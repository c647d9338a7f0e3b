//! Producer session.
//!
//! [`ProducerSession::send`] only enqueues. A background sender task drains
//! the queue, groups records per topic into batches of up to `batch_size`
//! (waiting at most `linger_ms` for a batch to fill) and produces them,
//! retrying retriable errors. [`flush`](ProducerSession::flush) resolves once
//! every record enqueued before it was acknowledged or given up on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use harness_core::codec::SerdeFormat;
use harness_core::config::ProducerConfig;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::BrokerConnection;
use crate::error::BrokerError;
use crate::protocol::{BrokerRequest, BrokerResponse, ErrorCode, WireRecord};

/// Queue depth, in batches.
const QUEUE_BATCHES: usize = 8;

#[derive(Debug)]
enum Command {
    Record {
        topic: String,
        record: WireRecord,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Fire-and-forget publisher bound to one broker.
#[derive(Debug)]
pub struct ProducerSession {
    client_id: String,
    key_format: SerdeFormat,
    value_format: SerdeFormat,
    queue: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    closed: AtomicBool,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl ProducerSession {
    /// Connect to `bootstrap` and start the sender task.
    pub async fn connect(
        bootstrap: &str,
        config: &ProducerConfig,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client_id = if config.client_id.is_empty() {
            format!("producer-{}", uuid::Uuid::new_v4())
        } else {
            config.client_id.clone()
        };
        let conn = BrokerConnection::connect(bootstrap, timeout, &client_id).await?;

        let batch_size = config.batch_size.max(1);
        let (queue, rx) = mpsc::channel(batch_size * QUEUE_BATCHES);
        let counters = Arc::new(Counters::default());
        let sender = Sender {
            conn,
            bootstrap: bootstrap.to_owned(),
            timeout,
            batch_size,
            linger: Duration::from_millis(config.linger_ms),
            retries: config.retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(sender.run(rx));

        info!(client_id, bootstrap, "producer session opened");
        Ok(Self {
            client_id,
            key_format: config.key_format,
            value_format: config.value_format,
            queue,
            counters,
            closed: AtomicBool::new(false),
            sender: Mutex::new(Some(handle)),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Encode and enqueue one record. Waits only for queue space.
    pub async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &str,
    ) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::SessionClosed);
        }
        let record = WireRecord {
            key: key.map(|k| self.key_format.encode(k)).transpose()?,
            value: self.value_format.encode(value)?,
            timestamp_ms: None,
        };
        self.queue
            .send(Command::Record {
                topic: topic.to_owned(),
                record,
            })
            .await
            .map_err(|_| BrokerError::SessionClosed)
    }

    /// Wait until everything enqueued so far was acknowledged or failed.
    pub async fn flush(&self) -> Result<(), BrokerError> {
        let (done, wait) = oneshot::channel();
        self.queue
            .send(Command::Flush(done))
            .await
            .map_err(|_| BrokerError::SessionClosed)?;
        wait.await.map_err(|_| BrokerError::SessionClosed)
    }

    /// Flush, then stop the sender task. Safe to call more than once.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.flush().await;
        if let Some(handle) = self.sender.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!(
            client_id = %self.client_id,
            sent = self.records_sent(),
            failed = self.records_failed(),
            "producer session closed"
        );
        flushed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records acknowledged by the broker.
    pub fn records_sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Records dropped after exhausting retries or on a fatal error.
    pub fn records_failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}

/// State owned by the background sender task.
#[derive(Debug)]
struct Sender {
    conn: BrokerConnection,
    bootstrap: String,
    timeout: Duration,
    batch_size: usize,
    linger: Duration,
    retries: u32,
    retry_backoff: Duration,
    counters: Arc<Counters>,
}

impl Sender {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        // Topic order of first appearance, each with its pending records.
        let mut pending: Vec<(String, Vec<WireRecord>)> = Vec::new();
        let mut waiters = Vec::new();

        while let Some(command) = rx.recv().await {
            let mut buffered = absorb(command, &mut pending, &mut waiters);

            let deadline = Instant::now() + self.linger;
            let mut open = true;
            while buffered < self.batch_size && waiters.is_empty() {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(command)) => buffered += absorb(command, &mut pending, &mut waiters),
                    Ok(None) => {
                        open = false;
                        break;
                    }
                    Err(_) => break,
                }
            }

            for (topic, records) in pending.drain(..) {
                for batch in records.chunks(self.batch_size) {
                    self.dispatch(&topic, batch).await;
                }
            }
            for waiter in waiters.drain(..) {
                let _ = waiter.send(());
            }
            if !open {
                break;
            }
        }

        self.conn.close();
        debug!(client_id = self.conn.client_id(), "producer sender stopped");
    }

    /// Produce one batch, retrying retriable failures.
    async fn dispatch(&mut self, topic: &str, batch: &[WireRecord]) {
        let count = batch.len() as u64;
        let mut attempt = 0;
        loop {
            let outcome = self
                .conn
                .send(BrokerRequest::Produce {
                    topic: topic.to_owned(),
                    partition: None,
                    records: batch.to_vec(),
                })
                .await;

            let retriable = match outcome {
                Ok(BrokerResponse::Produce {
                    error_code: ErrorCode::None,
                    ..
                }) => {
                    self.counters.sent.fetch_add(count, Ordering::Relaxed);
                    return;
                }
                Ok(BrokerResponse::Produce { error_code, .. }) => {
                    debug!(topic, %error_code, attempt, "produce rejected");
                    error_code.is_retriable()
                }
                Ok(other) => {
                    warn!(topic, response = ?other, "unexpected produce response");
                    false
                }
                Err(BrokerError::Server { code, .. }) => code.is_retriable(),
                Err(e) => {
                    debug!(topic, error = %e, attempt, "produce request failed");
                    self.reconnect().await
                }
            };

            if !retriable || attempt >= self.retries {
                warn!(topic, records = count, attempt, "giving up on batch");
                self.counters.failed.fetch_add(count, Ordering::Relaxed);
                return;
            }
            attempt += 1;
            tokio::time::sleep(self.retry_backoff).await;
            self.refresh_metadata(topic).await;
        }
    }

    /// Metadata round-trip between retries; lets the broker auto-create
    /// the topic when it is configured to.
    async fn refresh_metadata(&mut self, topic: &str) {
        let request = BrokerRequest::Metadata {
            topics: Some(vec![topic.to_owned()]),
            allow_auto_topic_creation: true,
        };
        if let Err(e) = self.conn.send(request).await {
            debug!(topic, error = %e, "metadata refresh failed");
        }
    }

    /// Replace a dropped connection. Returns whether a retry makes sense.
    async fn reconnect(&mut self) -> bool {
        if self.conn.is_open() {
            return true;
        }
        match BrokerConnection::connect(&self.bootstrap, self.timeout, self.conn.client_id()).await
        {
            Ok(conn) => {
                self.conn = conn;
                true
            }
            Err(e) => {
                debug!(bootstrap = %self.bootstrap, error = %e, "producer reconnect failed");
                false
            }
        }
    }
}

/// Buffer one command. Returns how many records it added.
fn absorb(
    command: Command,
    pending: &mut Vec<(String, Vec<WireRecord>)>,
    waiters: &mut Vec<oneshot::Sender<()>>,
) -> usize {
    match command {
        Command::Record { topic, record } => {
            match pending.iter_mut().find(|(t, _)| *t == topic) {
                Some((_, records)) => records.push(record),
                None => pending.push((topic, vec![record])),
            }
            1
        }
        Command::Flush(done) => {
            waiters.push(done);
            0
        }
    }
}
