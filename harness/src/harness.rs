//! The embedded Kafka harness.
//!
//! [`EmbeddedKafka`] owns one coordination service, one coordination client,
//! one broker and a lazily created producer session. Its lifecycle is
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//!
//! # Startup
//!
//! 1. coordination service, polled until it serves clients
//! 2. coordination client session
//! 3. broker bound to the live coordination endpoint, polled until ready
//!
//! A failure at any step rolls the started parts back and returns the error.
//!
//! # Shutdown
//!
//! Reverse order, every step best-effort: producer, controller resignation,
//! broker, broker log directories, coordination client, coordination service
//! (including its data directory), then all slots are cleared. Failures are
//! logged and collected into a [`ShutdownReport`].

use std::collections::HashMap;
use std::fmt;
use std::future::ready;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use harness_broker::{AdminClient, Broker, ConsumerSession, ProducerSession, ServerConfig, TopicDescriptor};
use harness_coordination::CoordinationClient;
use harness_core::metrics::{HARNESS_SHUTDOWN_FAILURES_TOTAL, HARNESS_STARTS_TOTAL, LABEL_STEP};
use harness_core::{
    EmbeddedService, HarnessConfig, HarnessError, HealthStatus, LifecycleCell, LifecycleState,
    ResourceSlot, RetryPoller, ShutdownFailure,
};

use crate::coordination::{CoordinationServiceHandle, remove_dir};
use crate::health::{ComponentHealth, HarnessHealth};
use crate::propagation;

/// Timeout message of the coordination readiness poll.
pub const COORDINATION_NOT_READY: &str = "Zookeeper must be started before proceeding";

/// Timeout message of the broker readiness poll.
pub const BROKER_NOT_READY: &str = "Kafka broker must be started before proceeding";

const NOT_STARTED: &str = "start the harness first";

/// Failures collected by [`EmbeddedKafka::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    failures: Vec<ShutdownFailure>,
}

impl ShutdownReport {
    /// `true` when every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[ShutdownFailure] {
        &self.failures
    }

    /// Record the outcome of one step. Failures are logged and counted.
    fn capture<E: fmt::Display>(&mut self, step: &'static str, outcome: Result<(), E>) {
        match outcome {
            Ok(()) => debug!(step, "shutdown step completed"),
            Err(e) => {
                warn!(step, error = %e, "shutdown step failed");
                metrics::counter!(HARNESS_SHUTDOWN_FAILURES_TOTAL, LABEL_STEP => step).increment(1);
                self.failures.push(ShutdownFailure {
                    step,
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Which of the four resource slots currently hold a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub coordination_service: bool,
    pub coordination_client: bool,
    pub broker: bool,
    pub producer: bool,
}

impl ResourceSnapshot {
    pub fn is_empty(&self) -> bool {
        !(self.coordination_service || self.coordination_client || self.broker || self.producer)
    }
}

/// Embedded coordination service plus broker for integration tests.
///
/// ```no_run
/// # async fn example() -> Result<(), harness_core::HarnessError> {
/// use kafka_harness::EmbeddedKafka;
///
/// let kafka = EmbeddedKafka::new(Default::default())?;
/// kafka.start().await?;
/// kafka.create_topic("orders", 3, 1).await?;
/// kafka.send_messages("orders", &["a", "b", "c"]).await?;
/// let report = kafka.shutdown().await;
/// assert!(report.is_clean());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EmbeddedKafka {
    settings: Arc<HarnessConfig>,
    /// Per-instance temp directory created for unset directory settings.
    owned_root: Option<PathBuf>,
    state: LifecycleCell,
    running: AtomicBool,
    coordination: ResourceSlot<CoordinationServiceHandle>,
    client: ResourceSlot<CoordinationClient>,
    broker: ResourceSlot<Broker>,
    producer: ResourceSlot<ProducerSession>,
}

impl EmbeddedKafka {
    /// Validate `settings` and resolve unset directories to a fresh
    /// per-instance temp directory. Nothing is started.
    pub fn new(settings: HarnessConfig) -> Result<Self, HarnessError> {
        settings.validate()?;
        let data_dir_unset = settings.coordination.data_dir.is_empty();
        let log_dirs_unset = settings.broker.log_dirs.is_empty();
        let settings = settings.resolve_directories();
        let owned_root = if data_dir_unset {
            settings.coordination.data_dir_path().parent().map(Path::to_path_buf)
        } else if log_dirs_unset {
            settings
                .broker
                .log_dir_paths()
                .first()
                .and_then(|dir| dir.parent())
                .map(Path::to_path_buf)
        } else {
            None
        };

        Ok(Self {
            settings: Arc::new(settings),
            owned_root,
            state: LifecycleCell::new(),
            running: AtomicBool::new(false),
            coordination: ResourceSlot::empty("coordination-service"),
            client: ResourceSlot::empty("coordination-client"),
            broker: ResourceSlot::empty("broker"),
            producer: ResourceSlot::empty("producer"),
        })
    }

    pub fn settings(&self) -> &Arc<HarnessConfig> {
        &self.settings
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Start coordination service, client and broker.
    ///
    /// A call while the harness is `Starting` or `Running` is a no-op.
    ///
    /// # Errors
    ///
    /// [`HarnessError::IllegalState`] while the harness is `Stopping`.
    /// [`HarnessError::PreconditionTimeout`] when a service does not become
    /// ready in time, or the error of the step that failed. Everything
    /// started before the failure is shut down again.
    pub async fn start(&self) -> Result<(), HarnessError> {
        match self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            Ok(()) => {}
            Err(LifecycleState::Stopping) => {
                return Err(HarnessError::illegal_state("harness is stopping"));
            }
            Err(current) => {
                debug!(state = %current, "harness already started, ignoring start");
                return Ok(());
            }
        }
        info!("starting embedded kafka");

        match self.bring_up().await {
            Ok(()) => {
                self.running.store(true, Ordering::Release);
                self.state.set(LifecycleState::Running);
                metrics::counter!(HARNESS_STARTS_TOTAL).increment(1);
                info!(
                    bootstrap = %self.bootstrap_servers().unwrap_or_default(),
                    coordination = %self.coordination_connect().unwrap_or_default(),
                    "embedded kafka running"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "embedded kafka failed to start, rolling back");
                self.state.set(LifecycleState::Stopping);
                let report = self.release().await;
                if !report.is_clean() {
                    warn!(failures = report.failures().len(), "rollback left failures behind");
                }
                self.state.set(LifecycleState::Stopped);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<(), HarnessError> {
        let coordination = self
            .coordination
            .try_set(CoordinationServiceHandle::new(self.settings.coordination.clone()))
            .map_err(|_| slot_taken(self.coordination.name()))?;
        coordination.start().await?;
        RetryPoller::new(self.settings.timeouts.coordination_startup())
            .await_condition(COORDINATION_NOT_READY, || ready(coordination.is_running()))
            .await?;

        let connect = coordination
            .connect_string()
            .ok_or_else(|| HarnessError::illegal_state("coordination service has no endpoint"))?;
        let client = CoordinationClient::connect(
            &connect,
            self.settings.coordination.connection_timeout(),
            self.settings.coordination.session_timeout(),
        )
        .await?;
        self.client
            .try_set(client)
            .map_err(|_| slot_taken(self.client.name()))?;

        let broker = self
            .broker
            .try_set(Broker::new(ServerConfig::from_core(&self.settings, &connect)))
            .map_err(|_| slot_taken(self.broker.name()))?;
        broker.start().await?;
        RetryPoller::new(self.settings.timeouts.broker_startup())
            .await_condition(BROKER_NOT_READY, || ready(broker.is_ready()))
            .await
    }

    /// Coordination service running, broker present and the running flag
    /// set.
    pub fn is_running(&self) -> bool {
        self.coordination
            .get()
            .is_some_and(|coordination| coordination.is_running())
            && self.broker.is_present()
            && self.running.load(Ordering::Acquire)
    }

    /// Stop everything in reverse startup order. Never fails; failed steps
    /// are returned in the report. Safe to call at any time, any number of
    /// times.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("running flag already cleared");
        }
        self.state.set(LifecycleState::Stopping);
        info!("shutting down embedded kafka");

        let report = self.release().await;
        self.state.set(LifecycleState::Stopped);
        if report.is_clean() {
            info!("embedded kafka stopped");
        } else {
            warn!(failures = report.failures().len(), "embedded kafka stopped with failures");
        }
        report
    }

    async fn release(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        if let Some(producer) = self.producer.get() {
            report.capture("producer", producer.close().await);
        }
        if let Some(broker) = self.broker.get() {
            report.capture(
                "controller",
                broker.resign_controller().await.map(|resigned| {
                    debug!(resigned, "controller role released");
                }),
            );
            report.capture("broker", broker.shutdown().await);
            broker.await_shutdown().await;
            for dir in broker.log_dirs() {
                report.capture("broker-logs", remove_dir(dir).await);
            }
        }
        if let Some(client) = self.client.get() {
            client.close().await;
        }
        if let Some(coordination) = self.coordination.get() {
            report.capture("coordination", coordination.shutdown().await);
        }
        if let Some(root) = &self.owned_root {
            report.capture("temp-dir", remove_dir(root).await);
        }

        self.producer.take();
        self.broker.take();
        self.client.take();
        self.coordination.take();
        report
    }

    /// The running broker, starting the harness first if there is none.
    ///
    /// # Errors
    ///
    /// [`HarnessError::IllegalState`] when the harness does not reach the
    /// running state in time.
    pub async fn server(&self) -> Result<Arc<Broker>, HarnessError> {
        if let Some(broker) = self.broker.get() {
            return Ok(broker);
        }
        warn!("broker accessed before start, starting embedded kafka");
        self.ensure_started().await?;
        self.broker
            .get()
            .ok_or_else(|| HarnessError::illegal_state("broker is not available"))
    }

    /// Start the harness if needed and wait until it is running.
    pub async fn ensure_started(&self) -> Result<(), HarnessError> {
        self.start().await?;
        RetryPoller::new(self.settings.timeouts.server_access())
            .await_condition("embedded kafka must be running", || ready(self.is_running()))
            .await
            .map_err(|e| HarnessError::illegal_state(format!("embedded kafka is not running: {e}")))
    }

    /// Current broker without side effects.
    pub fn broker(&self) -> Option<Arc<Broker>> {
        self.broker.get()
    }

    pub fn coordination_client(&self) -> Option<Arc<CoordinationClient>> {
        self.client.get()
    }

    /// `host:port` of the broker listener.
    pub fn bootstrap_servers(&self) -> Option<String> {
        self.broker.get().and_then(|broker| broker.bootstrap_servers())
    }

    /// `host:port` of the coordination service.
    pub fn coordination_connect(&self) -> Option<String> {
        self.coordination
            .get()
            .and_then(|coordination| coordination.connect_string())
    }

    /// Register a topic and wait until every partition has a leader.
    ///
    /// # Errors
    ///
    /// Admin errors (`TopicExists`, `InvalidReplicationFactor`, ...) are
    /// returned as [`HarnessError::Broker`] and can be recovered with
    /// [`HarnessError::domain_error`].
    pub async fn create_topic(
        &self,
        name: &str,
        partitions: i32,
        replication_factor: i16,
    ) -> Result<(), HarnessError> {
        let admin = self.admin()?;
        admin
            .create_topic(&TopicDescriptor::new(name, partitions, replication_factor))
            .await?;
        for partition in 0..partitions {
            propagation::await_partition(
                &admin,
                name,
                partition,
                self.settings.timeouts.propagation(),
            )
            .await?;
        }
        Ok(())
    }

    /// Wait until `topic`/`partition` has a valid leader and a non-empty ISR.
    pub async fn await_propagation(&self, topic: &str, partition: i32) -> Result<(), HarnessError> {
        let admin = self.admin()?;
        propagation::await_partition(&admin, topic, partition, self.settings.timeouts.propagation())
            .await
            .map(|_| ())
    }

    fn admin(&self) -> Result<AdminClient, HarnessError> {
        self.client
            .get()
            .map(AdminClient::new)
            .ok_or_else(|| HarnessError::illegal_state(NOT_STARTED))
    }

    /// The cached producer session, created on first use.
    ///
    /// # Errors
    ///
    /// [`HarnessError::IllegalState`] when the harness is not running.
    pub async fn producer(&self) -> Result<Arc<ProducerSession>, HarnessError> {
        if let Some(producer) = self.producer.get() {
            return Ok(producer);
        }
        let bootstrap = self.running_bootstrap()?;
        let session = ProducerSession::connect(
            &bootstrap,
            &self.settings.producer,
            self.settings.coordination.connection_timeout(),
        )
        .await?;

        match self.producer.try_set(session) {
            Ok(producer) => Ok(producer),
            Err((duplicate, existing)) => {
                if let Err(e) = duplicate.close().await {
                    debug!(error = %e, "closing duplicate producer failed");
                }
                Ok(existing)
            }
        }
    }

    /// Publish every message as its own record keyed by the message text,
    /// then flush.
    pub async fn send_messages<S: AsRef<str>>(
        &self,
        topic: &str,
        messages: &[S],
    ) -> Result<(), HarnessError> {
        let producer = self.producer().await?;
        let failed_before = producer.records_failed();
        for message in messages {
            let message = message.as_ref();
            producer.send(topic, Some(message), message).await?;
        }
        producer.flush().await?;

        let failed = producer.records_failed().saturating_sub(failed_before);
        if failed > 0 {
            warn!(topic, failed, "records were not acknowledged by the broker");
        }
        debug!(topic, count = messages.len(), "messages sent");
        Ok(())
    }

    /// Publish each message `count` times. No ordering across distinct
    /// messages.
    pub async fn send_message_counts(
        &self,
        topic: &str,
        counts: &HashMap<String, usize>,
    ) -> Result<(), HarnessError> {
        let messages: Vec<&str> = counts
            .iter()
            .flat_map(|(message, &count)| std::iter::repeat_n(message.as_str(), count))
            .collect();
        self.send_messages(topic, &messages).await
    }

    /// A new consumer session in `group_id`.
    pub async fn consumer(&self, group_id: &str) -> Result<ConsumerSession, HarnessError> {
        let bootstrap = self.running_bootstrap()?;
        Ok(ConsumerSession::connect(
            &bootstrap,
            group_id,
            &self.settings.consumer,
            self.settings.coordination.connection_timeout(),
        )
        .await?)
    }

    fn running_bootstrap(&self) -> Result<String, HarnessError> {
        if !self.is_running() {
            return Err(HarnessError::illegal_state(NOT_STARTED));
        }
        self.bootstrap_servers()
            .ok_or_else(|| HarnessError::illegal_state("broker has no listener"))
    }

    pub fn resources(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            coordination_service: self.coordination.is_present(),
            coordination_client: self.client.is_present(),
            broker: self.broker.is_present(),
            producer: self.producer.is_present(),
        }
    }

    pub fn health(&self) -> HarnessHealth {
        let mut components = vec![
            ComponentHealth::new(
                "coordination",
                self.coordination.get().map_or_else(
                    || HealthStatus::Unhealthy("not started".to_owned()),
                    |coordination| coordination.health(),
                ),
            ),
            ComponentHealth::new(
                "coordination-client",
                match self.client.get() {
                    Some(client) if client.is_connected() => HealthStatus::Healthy,
                    Some(_) => HealthStatus::Unhealthy("session closed".to_owned()),
                    None => HealthStatus::Unhealthy("not connected".to_owned()),
                },
            ),
            ComponentHealth::new(
                "broker",
                self.broker.get().map_or_else(
                    || HealthStatus::Unhealthy("not started".to_owned()),
                    |broker| broker.health_check(),
                ),
            ),
        ];
        if let Some(producer) = self.producer.get() {
            let status = if producer.is_closed() {
                HealthStatus::Degraded("producer closed".to_owned())
            } else {
                HealthStatus::Healthy
            };
            components.push(ComponentHealth::new("producer", status));
        }
        HarnessHealth::new(self.state(), components)
    }
}

impl Drop for EmbeddedKafka {
    fn drop(&mut self) {
        let broker = self.broker.take();
        let coordination = self.coordination.take();
        if broker.is_none() && coordination.is_none() {
            return;
        }
        warn!("embedded kafka dropped without shutdown, aborting services");

        self.producer.take();
        if let Some(broker) = broker {
            broker.abort();
            for dir in broker.log_dirs() {
                remove_dir_blocking(dir);
            }
        }
        self.client.take();
        if let Some(coordination) = coordination {
            coordination.abort();
        }
        if let Some(root) = &self.owned_root {
            remove_dir_blocking(root);
        }
        self.running.store(false, Ordering::Release);
        self.state.set(LifecycleState::Stopped);
    }
}

fn remove_dir_blocking(dir: &Path) {
    if !dir.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "failed to remove directory");
    }
}

fn slot_taken(name: &str) -> HarnessError {
    HarnessError::illegal_state(format!("{name} slot is already filled"))
}
