//! Unix-socket listener feeding the bounded admission queue.
//!
//! The listener only accepts and enqueues; descriptor parsing and admission
//! happen inside the engine's scrape pass, keeping the accept loop fully
//! decoupled from scrape cadence. It never touches locked state, so it
//! cannot deadlock against a slow scrape.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::net::UnixListener;
use tracing::{info, warn};

use fakedev_engine::ConnSender;

use crate::conn::UnixConn;

/// Accepts workload connections on the given socket path until the engine
/// side of the queue goes away.
pub async fn listen_for_workloads<P: AsRef<Path>>(path: P, queue: ConnSender) -> io::Result<()> {
    let path = path.as_ref();
    // A stale socket file from a previous run would make bind fail.
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    // Workload admission has no authentication; keep the socket owner-only.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    info!(path = %path.display(), "listening on unix socket");
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                // A burst beyond queue capacity blocks here: connections
                // wait for the next scrape instead of being dropped.
                if queue.send(Box::new(UnixConn::new(stream))).await.is_err() {
                    return Ok(());
                }
            }
            Err(err) => warn!(%err, path = %path.display(), "unix socket accept failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fakedev_engine::admission_queue;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn accepted_connections_reach_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let (tx, mut rx) = admission_queue();
        let listener_path = path.clone();
        let listener = tokio::spawn(async move {
            let _ = listen_for_workloads(&listener_path, tx).await;
        });

        let mut client = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        };
        client.write_all(b"{}").await.unwrap();

        let mut conn = rx.recv().await.expect("connection enqueued");
        let text = conn.read_descriptor().await.unwrap();
        assert_eq!(&text[..], b"{}");

        listener.abort();
    }

    #[tokio::test]
    async fn socket_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let (tx, _rx) = admission_queue();
        let listener_path = path.clone();
        let listener = tokio::spawn(async move {
            let _ = listen_for_workloads(&listener_path, tx).await;
        });

        // Poll: the socket appears at bind and is restricted right after.
        let mut mode = 0;
        for _ in 0..200 {
            if let Ok(metadata) = std::fs::metadata(&path) {
                mode = metadata.permissions().mode() & 0o777;
                if mode == 0o700 {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(mode, 0o700);

        listener.abort();
    }
}
