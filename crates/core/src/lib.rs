//! Shared building blocks for kafka-harness.
//!
//! - [`config`]: immutable harness settings (`kafka-harness.toml`)
//! - [`error`]: error taxonomy shared by all crates
//! - [`retry`]: bounded fixed-interval readiness polling
//! - [`slot`]: single-slot shared resource cells
//! - [`lifecycle`]: lifecycle state, health status and the service contract
//! - [`codec`]: named record serialization strategies
//! - [`metrics`]: metric names
//! - [`wire`]: correlated request/response connections

pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod retry;
pub mod slot;
pub mod wire;

// --- re-exports ---

pub use codec::SerdeFormat;
pub use config::{
    BrokerConfig, ConsumerConfig, CoordinationConfig, GeneralConfig, HarnessConfig, OffsetReset,
    ProducerConfig, TimeoutsConfig,
};
pub use error::{BoxError, CodecError, ConfigError, HarnessError, ShutdownFailure};
pub use lifecycle::{EmbeddedService, HealthStatus, LifecycleCell, LifecycleState};
pub use retry::{PollSpec, RetryPoller};
pub use slot::ResourceSlot;
pub use wire::{Correlated, WireConnection, WireError};
