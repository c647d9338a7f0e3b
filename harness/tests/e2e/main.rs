//! End-to-end tests for kafka-harness.
//!
//! Every test runs a real embedded coordination service and broker on
//! loopback with ephemeral ports and its own temp directories.
//!
//! # Test Structure
//!
//! - `helpers/` -- harness fixtures and polling assertions
//! - `scenarios/` -- one file per area (lifecycle, topics, round trip,
//!   accessors, cleanup)
//!
//! # Running
//!
//! ```bash
//! cargo test -p kafka-harness --test e2e
//! ```

mod helpers;
mod scenarios;
