//! # fakedev-engine
//!
//! Workload scheduling and aggregation core of the fake device exporter.
//!
//! Scrapes are the logical clock: every scrape drains the bounded admission
//! queue, recomputes all device metric values from the active workloads,
//! advances or retires workloads, and renders the exposition text. Nothing
//! here owns a socket; connections arrive through the [`conn::WorkloadConn`]
//! capability so the whole lifecycle is testable in-memory.

pub mod conn;
pub mod encode;
pub mod engine;
pub mod workload;

pub use conn::{admission_queue, BoxConn, ConnReceiver, ConnSender, ExitStatus, Liveness,
    WorkloadConn, WL_MAX_BATCH};
pub use engine::SimulationEngine;
pub use workload::{AdmissionError, ProfileSpec, Workload, WorkloadSpec, WorkloadStore};
