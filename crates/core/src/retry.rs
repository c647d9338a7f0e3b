//! Bounded readiness polling.
//!
//! Every readiness wait in the harness (coordination startup, broker startup,
//! topic propagation, test-side delivery assertions) goes through
//! [`RetryPoller`]. The check is evaluated, and if it is not yet satisfied the
//! poller sleeps for the fixed interval and tries again, until the window
//! closes with [`HarnessError::PreconditionTimeout`].
//!
//! ```no_run
//! # async fn example() -> Result<(), harness_core::error::HarnessError> {
//! use std::time::Duration;
//! use harness_core::retry::{PollSpec, RetryPoller};
//!
//! let poller = RetryPoller::new(PollSpec::new(Duration::from_secs(5), Duration::from_millis(500)));
//! poller
//!     .await_condition("Zookeeper must be started before proceeding", || async { true })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::HarnessError;

/// Timeout and fixed interval for one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    /// Total window
    pub timeout: Duration,
    /// Pause between attempts
    pub interval: Duration,
}

impl PollSpec {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub const fn from_millis(timeout_ms: u64, interval_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    /// Coordination service readiness: 5s window, 500ms interval.
    pub const COORDINATION_STARTUP: Self = Self::from_millis(5_000, 500);
    /// Broker readiness: 5s window, 100ms interval.
    pub const BROKER_STARTUP: Self = Self::from_millis(5_000, 100);
    /// Topic metadata propagation: 10s window, 100ms interval.
    pub const PROPAGATION: Self = Self::from_millis(10_000, 100);
    /// Test-side message delivery assertions: 10s window, 100ms interval.
    pub const MESSAGE_DELIVERY: Self = Self::from_millis(10_000, 100);
}

/// Fixed-interval bounded poller.
#[derive(Debug, Clone, Copy)]
pub struct RetryPoller {
    spec: PollSpec,
}

impl RetryPoller {
    pub fn new(spec: PollSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> PollSpec {
        self.spec
    }

    /// Poll `predicate` until it returns `true`.
    ///
    /// # Errors
    ///
    /// [`HarnessError::PreconditionTimeout`] carrying `message` when the
    /// window elapses first.
    pub async fn await_condition<F, Fut>(
        &self,
        message: &str,
        mut predicate: F,
    ) -> Result<(), HarnessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.await_value(message, || {
            let check = predicate();
            async move { check.await.then_some(()) }
        })
        .await
    }

    /// Poll `check` until it yields `Some(value)` and return the value.
    pub async fn await_value<T, F, Fut>(
        &self,
        message: &str,
        mut check: F,
    ) -> Result<T, HarnessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let started = Instant::now();
        let deadline = started + self.spec.timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if let Some(value) = check().await {
                trace!(attempts, elapsed_ms = elapsed_ms(started), "condition satisfied");
                return Ok(value);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = elapsed_ms(started);
                warn!(attempts, waited_ms, message, "readiness poll timed out");
                return Err(HarnessError::PreconditionTimeout {
                    message: message.to_owned(),
                    waited_ms,
                });
            }

            trace!(attempts, "condition not met, sleeping");
            tokio::time::sleep(self.spec.interval.min(deadline - now)).await;
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ready_after(polls: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<bool>) {
        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);
        let predicate = move || {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(n >= polls)
        };
        (counter, predicate)
    }

    #[tokio::test]
    async fn returns_immediately_when_condition_holds() {
        let poller = RetryPoller::new(PollSpec::from_millis(1_000, 100));
        let (counter, predicate) = ready_after(1);
        poller.await_condition("ready", predicate).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_when_ready_within_window() {
        let poller = RetryPoller::new(PollSpec::PROPAGATION);
        let (counter, predicate) = ready_after(50);
        poller.await_condition("propagated", predicate).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_caller_message() {
        let poller = RetryPoller::new(PollSpec::from_millis(1_000, 100));
        let (counter, predicate) = ready_after(u32::MAX);
        let err = poller
            .await_condition("Zookeeper must be started before proceeding", predicate)
            .await
            .unwrap_err();
        match err {
            HarnessError::PreconditionTimeout { message, waited_ms } => {
                assert_eq!(message, "Zookeeper must be started before proceeding");
                assert!(waited_ms >= 1_000);
            }
            other => panic!("unexpected error: {other}"),
        }
        // one attempt at t=0 plus one per interval, including the deadline
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn never_sleeps_past_the_deadline() {
        let poller = RetryPoller::new(PollSpec::from_millis(250, 100));
        let started = Instant::now();
        let (_, predicate) = ready_after(u32::MAX);
        assert!(poller.await_condition("never", predicate).await.is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn await_value_returns_the_checked_value() {
        let poller = RetryPoller::new(PollSpec::from_millis(1_000, 10));
        let mut calls = 0;
        let value = poller
            .await_value("value", || {
                calls += 1;
                let result = (calls == 3).then_some(calls * 10);
                async move { result }
            })
            .await
            .unwrap();
        assert_eq!(value, 30);
    }
}
