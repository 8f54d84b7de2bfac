//! Operator debug tap: a localhost TCP listener that mirrors tagged copies
//! of traffic (`[in]`, `[out]`, `[forward]`) to every connected client.
//!
//! The hot path never waits on the tap. Events pass through a bounded queue
//! with `try_send` (excess is dropped) behind an atomic has-clients flag, so
//! when nobody is connected not even the formatting happens. The tap task
//! gives each client 10 ms per write; slower clients are evicted rather than
//! allowed to hold up everyone else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TAP_QUEUE_SIZE: usize = 256;
const WRITE_BUDGET: Duration = Duration::from_millis(10);

/// Cheap, clone-able publisher for the hot path. A disabled handle makes
/// every call a no-op.
#[derive(Clone)]
pub struct TapHandle {
    shared: Option<Arc<TapShared>>,
}

struct TapShared {
    tx: mpsc::Sender<String>,
    active: AtomicBool,
}

impl TapHandle {
    /// A tap that mirrors nothing.
    pub fn disabled() -> Self {
        Self { shared: None }
    }

    /// Whether any debug client is currently connected.
    pub fn is_active(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.active.load(Ordering::Relaxed))
    }

    /// Mirrors one line under the given tag. Never blocks; drops the event
    /// when the tap task is behind.
    pub fn print(&self, tag: &str, line: &str) {
        let Some(shared) = &self.shared else { return };
        if !shared.active.load(Ordering::Relaxed) {
            return;
        }
        let mut msg = String::with_capacity(tag.len() + line.len() + 1);
        msg.push_str(tag);
        msg.push_str(line);
        msg.push('\n');
        let _ = shared.tx.try_send(msg);
    }

    /// Mirrors one raw message, lossily decoded.
    pub fn print_bytes(&self, tag: &str, line: &[u8]) {
        if self.is_active() {
            self.print(tag, &String::from_utf8_lossy(line));
        }
    }

    /// Mirrors every non-empty line of a multi-line payload.
    pub fn print_payload(&self, tag: &str, payload: &[u8]) {
        if !self.is_active() {
            return;
        }
        for line in payload.split(|&b| b == b'\n') {
            if !line.is_empty() {
                self.print(tag, &String::from_utf8_lossy(line));
            }
        }
    }
}

/// Binds the tap listener on localhost and spawns the tap task. Bind
/// failures are fatal, like any other listener at startup.
pub async fn start(port: u16, cancel: CancellationToken) -> Result<TapHandle> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding debug tap on 127.0.0.1:{port}"))?;
    info!(port, "listening for debug tap clients");

    let (tx, rx) = mpsc::channel(TAP_QUEUE_SIZE);
    let shared = Arc::new(TapShared {
        tx,
        active: AtomicBool::new(false),
    });

    tokio::spawn(tap_loop(listener, rx, Arc::clone(&shared), cancel));

    Ok(TapHandle {
        shared: Some(shared),
    })
}

async fn tap_loop(
    listener: TcpListener,
    mut rx: mpsc::Receiver<String>,
    shared: Arc<TapShared>,
    cancel: CancellationToken,
) {
    let mut clients: Vec<TcpStream> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => {
                if let Ok((stream, peer)) = res {
                    debug!(peer = %peer, clients = clients.len() + 1, "debug client connected");
                    clients.push(stream);
                    shared.active.store(true, Ordering::Relaxed);
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { return };
                broadcast(&mut clients, &msg).await;
                if clients.is_empty() {
                    shared.active.store(false, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Writes one message to every client, evicting any that cannot take it
/// within the write budget.
async fn broadcast(clients: &mut Vec<TcpStream>, msg: &str) {
    let mut kept = Vec::with_capacity(clients.len());

    for mut client in clients.drain(..) {
        match tokio::time::timeout(WRITE_BUDGET, client.write_all(msg.as_bytes())).await {
            Ok(Ok(())) => kept.push(client),
            Ok(Err(e)) => {
                debug!(error = %e, "debug client disconnected");
            }
            Err(_) => {
                debug!("debug client too slow, evicting");
            }
        }
    }

    *clients = kept;
}
