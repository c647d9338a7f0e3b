//! E2E test scenarios.

mod accessors;
mod cleanup;
mod lifecycle;
mod roundtrip;
mod topics;
