//! Polling assertions for E2E tests.

use std::future::ready;
use std::path::Path;
use std::time::Duration;

use harness_broker::ConsumerCounter;
use harness_core::{PollSpec, RetryPoller};

/// Window for records to reach a consumer.
#[allow(dead_code)]
pub const DELIVERY: PollSpec = PollSpec::MESSAGE_DELIVERY;

/// Default timeout for a single consumer poll.
#[allow(dead_code)]
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Wait until `counter` has seen at least `expected` records.
///
/// # Panics
///
/// Panics with the last observed count when the window elapses.
#[allow(dead_code)]
pub async fn assert_count_reaches(counter: &ConsumerCounter, expected: u64, spec: PollSpec) {
    let result = RetryPoller::new(spec)
        .await_condition("consumer did not receive all records", || {
            ready(counter.count() >= expected)
        })
        .await;
    if let Err(e) = result {
        panic!(
            "{e}: received {} of {expected} records",
            counter.count()
        );
    }
}

/// # Panics
///
/// Panics if any of `dirs` still exists.
#[allow(dead_code)]
pub fn assert_dirs_removed<P: AsRef<Path>>(dirs: &[P]) {
    for dir in dirs {
        let dir = dir.as_ref();
        assert!(!dir.exists(), "{} should have been removed", dir.display());
    }
}
