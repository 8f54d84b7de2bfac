//! UDP ingress: the receive loop, per-datagram line handling, and the
//! classifier that routes decoded stats to their aggregation queue.

pub mod pool;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::statsd::{self, MetaSender, Stat, StatKind};
use crate::tap::TapHandle;

use self::pool::{BufferPool, PoolHandle};

/// Routes parsed stats to either the main ingest queue or the
/// forwarding-leaf queue, never both.
#[derive(Clone)]
pub struct StatRouter {
    pub main: mpsc::Sender<Stat>,
    /// Present only when the leaf role is enabled.
    pub leaf: Option<mpsc::Sender<Stat>>,
    pub meta: MetaSender,
    pub tap: TapHandle,
}

impl StatRouter {
    async fn route(&self, stat: Stat) {
        if stat.forward {
            if stat.kind != StatKind::Counter {
                self.meta.inc("errors.bad_metric_type_for_forwarding").await;
                return;
            }
            match &self.leaf {
                Some(tx) => {
                    let _ = tx.send(stat).await;
                }
                None => self.meta.inc("errors.forwarding_disabled").await,
            }
        } else {
            let _ = self.main.send(stat).await;
        }
    }
}

/// The UDP receive loop. Returns `Ok(())` on cancellation and `Err` only on
/// an unrecoverable socket error, which is fatal for the process.
pub async fn receive_loop(
    socket: UdpSocket,
    mut pool: BufferPool,
    router: StatRouter,
    cancel: CancellationToken,
) -> Result<()> {
    let handle = pool.handle();

    loop {
        let mut buf = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            buf = pool.acquire() => buf,
        };

        let received = tokio::select! {
            _ = cancel.cancelled() => None,
            res = socket.recv_from(&mut buf) => Some(res),
        };

        let n = match received {
            None => {
                handle.release(buf);
                return Ok(());
            }
            Some(Ok((n, _peer))) => n,
            Some(Err(e)) => {
                handle.release(buf);
                return Err(e).context("reading from UDP socket");
            }
        };

        router.meta.inc("packets_received").await;

        // A datagram filling the whole buffer may have been truncated.
        if n >= pool::BUFFER_SIZE {
            router.meta.inc("errors.udp_message_too_large").await;
            handle.release(buf);
            continue;
        }

        tokio::spawn(handle_datagram(buf, n, router.clone(), handle.clone()));
    }
}

/// Handles every message in one datagram, then releases the buffer. This is
/// the parse task's entry point; stats it produces own their data, so the
/// buffer can be reused immediately afterwards.
pub async fn handle_datagram(buf: Vec<u8>, len: usize, router: StatRouter, pool: PoolHandle) {
    handle_lines(&buf[..len], &router).await;
    pool.release(buf);
}

/// Splits a payload into newline-delimited messages and parses each one.
/// Empty messages are skipped silently; malformed ones are counted and
/// dropped.
pub async fn handle_lines(data: &[u8], router: &StatRouter) {
    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        router.tap.print_bytes("[in] ", line);
        match statsd::parse_line(line) {
            Some(stat) => router.route(stat).await,
            None => {
                debug!(line = %String::from_utf8_lossy(line), "bad message");
                router.meta.inc("errors.bad_message").await;
            }
        }
    }
}
