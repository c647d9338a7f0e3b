//! Metric names and descriptions.
//!
//! All metric names live here; crates call `metrics::counter!()` /
//! `metrics::histogram!()` with these constants. Nothing is exported unless
//! the embedding process installs a recorder.
//!
//! # Naming
//!
//! - prefix: `kafka_harness_`
//! - component: `coordination_`, `broker_`, `harness_`
//! - suffix: `_total` (counter), `_seconds` (histogram), none (gauge)

/// Topic label key
pub const LABEL_TOPIC: &str = "topic";

/// Shutdown step label key
pub const LABEL_STEP: &str = "step";

/// Coordination operation label key (create, get_data, ...)
pub const LABEL_OP: &str = "op";

// ─── Coordination service ───────────────────────────────────────────

/// Coordination: requests served (counter, label: op)
pub const COORDINATION_REQUESTS_TOTAL: &str = "kafka_harness_coordination_requests_total";

/// Coordination: sessions currently open (gauge)
pub const COORDINATION_OPEN_SESSIONS: &str = "kafka_harness_coordination_open_sessions";

// ─── Broker ─────────────────────────────────────────────────────────

/// Broker: records appended (counter, label: topic)
pub const BROKER_RECORDS_IN_TOTAL: &str = "kafka_harness_broker_records_in_total";

/// Broker: payload bytes appended (counter)
pub const BROKER_BYTES_IN_TOTAL: &str = "kafka_harness_broker_bytes_in_total";

/// Broker: records returned by fetches (counter)
pub const BROKER_RECORDS_OUT_TOTAL: &str = "kafka_harness_broker_records_out_total";

/// Broker: partitions this broker leads (gauge)
pub const BROKER_LEADER_PARTITIONS: &str = "kafka_harness_broker_leader_partitions";

// ─── Harness ────────────────────────────────────────────────────────

/// Harness: successful starts (counter)
pub const HARNESS_STARTS_TOTAL: &str = "kafka_harness_harness_starts_total";

/// Harness: topics created through the admin API (counter)
pub const HARNESS_TOPICS_CREATED_TOTAL: &str = "kafka_harness_harness_topics_created_total";

/// Harness: time until a partition had a leader and ISR (histogram, seconds)
pub const HARNESS_PROPAGATION_WAIT_SECONDS: &str =
    "kafka_harness_harness_propagation_wait_seconds";

/// Harness: failed shutdown steps (counter, label: step)
pub const HARNESS_SHUTDOWN_FAILURES_TOTAL: &str =
    "kafka_harness_harness_shutdown_failures_total";

/// Register descriptions with the installed recorder.
pub fn describe_metrics() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        COORDINATION_REQUESTS_TOTAL,
        "Requests served by the embedded coordination service"
    );
    describe_gauge!(
        COORDINATION_OPEN_SESSIONS,
        "Open coordination client sessions"
    );
    describe_counter!(BROKER_RECORDS_IN_TOTAL, "Records appended to partition logs");
    describe_counter!(BROKER_BYTES_IN_TOTAL, "Payload bytes appended to partition logs");
    describe_counter!(BROKER_RECORDS_OUT_TOTAL, "Records returned to fetch requests");
    describe_gauge!(BROKER_LEADER_PARTITIONS, "Partitions led by the embedded broker");
    describe_counter!(HARNESS_STARTS_TOTAL, "Successful harness starts");
    describe_counter!(HARNESS_TOPICS_CREATED_TOTAL, "Topics created via the harness");
    describe_histogram!(
        HARNESS_PROPAGATION_WAIT_SECONDS,
        metrics::Unit::Seconds,
        "Time for topic metadata to show a leader and ISR"
    );
    describe_counter!(
        HARNESS_SHUTDOWN_FAILURES_TOTAL,
        "Shutdown steps that failed and were suppressed"
    );
}
