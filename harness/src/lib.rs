//! In-process Kafka test harness.
//!
//! [`EmbeddedKafka`] runs an embedded coordination service and a single
//! broker on loopback, creates topics, hands out producer and consumer
//! sessions and tears everything down again, including on-disk state.
//!
//! ```no_run
//! # async fn example() -> Result<(), harness_core::HarnessError> {
//! use kafka_harness::EmbeddedKafka;
//!
//! let kafka = EmbeddedKafka::new(Default::default())?;
//! kafka.start().await?;
//! kafka.create_topic("orders", 1, 1).await?;
//! kafka.send_messages("orders", &["hello"]).await?;
//! kafka.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod coordination;
pub mod harness;
pub mod health;
pub mod logging;
pub mod propagation;

pub use coordination::CoordinationServiceHandle;
pub use harness::{EmbeddedKafka, ResourceSnapshot, ShutdownReport};
pub use health::{ComponentHealth, HarnessHealth};
pub use propagation::PartitionStateSource;

pub use harness_broker::{ConsumedRecord, ConsumerSession, ProducerSession};
pub use harness_core::{HarnessConfig, HarnessError, LifecycleState};
