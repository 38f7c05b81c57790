//! Unix-socket adapter for the workload connection capability.
//!
//! All reads are bounded by short deadlines so a slow or hostile client can
//! never stall a scrape for long.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::warn;

use fakedev_engine::{ExitStatus, Liveness, WorkloadConn};

/// Deadline for reading one workload descriptor off a queued connection.
const READ_DEADLINE: Duration = Duration::from_millis(10);

/// Probe read deadline. Hitting it with no data is the expected
/// steady-state outcome and means the peer is still connected.
const PROBE_DEADLINE: Duration = Duration::from_millis(1);

/// Descriptor documents are small; a single read this large covers them.
const MAX_DESCRIPTOR: usize = 1024;

pub struct UnixConn {
    stream: UnixStream,
}

impl UnixConn {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl WorkloadConn for UnixConn {
    async fn read_descriptor(&mut self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; MAX_DESCRIPTOR];
        match timeout(READ_DEADLINE, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "zero bytes from workload connection",
            )),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "descriptor read deadline exceeded",
            )),
        }
    }

    async fn probe(&mut self) -> Liveness {
        let mut buf = [0u8; 1];
        match timeout(PROBE_DEADLINE, self.stream.read(&mut buf)).await {
            // Deadline exceeded with no data: peer still connected.
            Err(_) => Liveness::StillOpen,
            // Data, clean close or an I/O error all mean it is gone.
            Ok(_) => Liveness::Closed,
        }
    }

    async fn send_status(&mut self, status: ExitStatus) {
        if let Err(err) = self.stream.write_all(&[status.as_byte()]).await {
            warn!(%err, "workload status write failed");
        }
        let _ = self.stream.shutdown().await;
    }
}
