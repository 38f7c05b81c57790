//! # fakedev-server
//!
//! Network adapters around the simulation engine: the Unix-socket workload
//! listener feeding the bounded admission queue, and the HTTP scrape
//! endpoint that drives the engine. Neither side parses or schedules
//! anything itself; all of that lives in `fakedev-engine`.

pub mod conn;
pub mod http;
pub mod ipc;

pub use conn::UnixConn;
pub use http::{listen_metrics, SharedEngine, METRIC_PATH};
pub use ipc::listen_for_workloads;
