//! # fakedev-telemetry
//!
//! Structured logging setup shared by the exporter and the workload client.

pub mod logging;

pub use logging::EventLogger;
