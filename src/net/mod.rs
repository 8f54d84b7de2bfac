//! Long-lived TCP client plumbing shared by the Graphite and forwarding
//! links.

use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const SHUTDOWN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Keepalive period applied to every TCP connection this process manages.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Enables TCP keepalive with [`KEEPALIVE_PERIOD`] on a stream.
pub fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let mut keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    #[cfg(not(any(target_os = "openbsd", target_os = "redox", target_os = "solaris")))]
    {
        keepalive = keepalive.with_interval(KEEPALIVE_PERIOD);
    }
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// A single logical connection to a configured address, dialed lazily and
/// redialed after failures.
///
/// [`write`](Self::write) blocks until a connection exists, retrying failed
/// dials with exponential backoff (100 ms doubling, capped at 5 s), then
/// attempts the write exactly once. A write failure invalidates the
/// connection and surfaces the error; the payload is discarded by the caller
/// and the next write redials. [`close`](Self::close) is idempotent.
pub struct PersistentConn {
    addr: String,
    stream: Option<TcpStream>,
}

impl PersistentConn {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Delivers one payload, dialing first if necessary.
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        if self.stream.is_none() {
            self.connect().await;
        }

        let stream = self.stream.as_mut().expect("connected above");
        if let Err(e) = stream.write_all(payload).await {
            self.stream = None;
            return Err(e).with_context(|| format!("writing to {}", self.addr));
        }

        Ok(())
    }

    /// Drops the underlying socket, if any.
    pub fn close(&mut self) {
        self.stream.take();
    }

    async fn connect(&mut self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    if let Err(e) = set_keepalive(&stream) {
                        debug!(addr = %self.addr, error = %e, "failed to set TCP keepalive");
                    }
                    info!(addr = %self.addr, "connected");
                    self.stream = Some(stream);
                    return;
                }
                Err(e) => {
                    warn!(
                        addr = %self.addr,
                        error = %e,
                        retry_in = ?backoff,
                        "dial failed",
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// Drains a payload queue into a persistent connection.
///
/// Used for both the Graphite link and the leaf forwarding link. Payloads
/// are delivered in order; a failed write is logged and that payload is
/// dropped (the connection redials on the next one). On cancellation the
/// remaining queue is drained best-effort, with a bounded per-write timeout
/// so a dead endpoint cannot stall shutdown.
pub async fn writer_loop<F>(
    mut conn: PersistentConn,
    mut rx: mpsc::Receiver<Vec<u8>>,
    tap: F,
    cancel: CancellationToken,
) where
    F: Fn(&[u8]),
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                tap(&payload);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = conn.write(&payload) => {
                        if let Err(e) = res {
                            warn!(error = %e, "dropping payload after failed write");
                        }
                    }
                }
            }
        }
    }

    while let Ok(payload) = rx.try_recv() {
        match tokio::time::timeout(SHUTDOWN_WRITE_TIMEOUT, conn.write(&payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "dropping payload after failed write");
            }
            Err(_) => {
                debug!(addr = conn.addr(), "shutdown drain timed out");
                break;
            }
        }
    }

    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_write_dials_lazily_and_delivers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.expect("read");
            buf
        });

        let mut conn = PersistentConn::new(addr.to_string());
        conn.write(b"ns.foo.count 3 1700000000\n")
            .await
            .expect("write succeeds");
        conn.close();

        let received = server.await.expect("server task");
        assert_eq!(received, b"ns.foo.count 3 1700000000\n");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut conn = PersistentConn::new("127.0.0.1:1");
        conn.close();
        conn.close();
        assert_eq!(conn.addr(), "127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_writer_loop_preserves_payload_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.expect("read");
            buf
        });

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(writer_loop(
            PersistentConn::new(addr.to_string()),
            rx,
            |_| {},
            cancel.clone(),
        ));

        tx.send(b"first 1 10\n".to_vec()).await.expect("send");
        tx.send(b"second 2 20\n".to_vec()).await.expect("send");
        drop(tx);

        writer.await.expect("writer task");
        let received = server.await.expect("server task");
        assert_eq!(received, b"first 1 10\nsecond 2 20\n");
    }
}
