//! Abstract workload connection capability.
//!
//! The engine never touches sockets directly: it sees a connection only as
//! something it can read one descriptor from, probe for liveness, and send a
//! single exit status byte to. The real Unix-socket adapter lives in the
//! server crate; tests use an in-memory fake.

use async_trait::async_trait;
use bytes::Bytes;

/// How many workload connections are buffered between scrapes before the
/// accept loop blocks (roughly how many workloads a scheduler could place
/// between two scrape queries).
pub const WL_MAX_BATCH: usize = 16;

/// Outcome of a liveness probe on a workload connection.
///
/// A probe timing out with no data is the expected steady state and means
/// the peer is still there; data, a clean close, or any I/O error all mean
/// the workload is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    StillOpen,
    Closed,
}

/// Single-byte status code written back to a workload client before its
/// connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// `"0"`: workload accepted and completed naturally.
    Ok,
    /// `"1"`: workload rejected or failed.
    Error,
}

impl ExitStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            ExitStatus::Ok => b'0',
            ExitStatus::Error => b'1',
        }
    }
}

/// One workload connection, as seen by the engine.
#[async_trait]
pub trait WorkloadConn: Send {
    /// Reads the raw workload descriptor. Implementations bound the read
    /// with a short deadline; zero bytes within it is an error.
    async fn read_descriptor(&mut self) -> std::io::Result<Bytes>;

    /// Checks whether the peer is still connected, without blocking the
    /// scrape for more than a very short deadline.
    async fn probe(&mut self) -> Liveness;

    /// Writes the exit status byte. Failures are the implementation's to
    /// log; there is nothing the engine could do about them.
    async fn send_status(&mut self, status: ExitStatus);
}

pub type BoxConn = Box<dyn WorkloadConn>;

/// Bounded admission queue handles. The sender side blocks when the queue
/// holds [`WL_MAX_BATCH`] connections, which is the intended backpressure.
pub type ConnSender = tokio::sync::mpsc::Sender<BoxConn>;
pub type ConnReceiver = tokio::sync::mpsc::Receiver<BoxConn>;

/// Creates the admission queue connecting the IPC listener to the engine.
pub fn admission_queue() -> (ConnSender, ConnReceiver) {
    tokio::sync::mpsc::channel(WL_MAX_BATCH)
}
