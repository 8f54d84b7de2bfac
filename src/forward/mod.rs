//! Upstream side of the two-tier forwarding topology: accept leaf
//! connections, decode their frame streams, and feed the forwarded
//! aggregator. The leaf side is just an aggregator flush loop plus the
//! shared writer; it lives in `aggregate::runner` and `net`.

pub mod frame;

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net;
use crate::statsd::MetaSender;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Accepts leaf connections and spawns one decoder task per stream.
///
/// Every accepted socket gets the 30 s keepalive. Transient accept errors
/// are retried after a short sleep; anything else terminates the listener
/// with an error. Decoder failures never affect the listener.
pub async fn upstream_listener(
    listener: TcpListener,
    merge_tx: mpsc::Sender<HashMap<String, f64>>,
    meta: MetaSender,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    if let Err(e) = net::set_keepalive(&stream) {
                        debug!(peer = %peer, error = %e, "failed to set TCP keepalive");
                    }
                    debug!(peer = %peer, "leaf connected");
                    tokio::spawn(decode_stream(
                        stream,
                        merge_tx.clone(),
                        meta.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, retry_in = ?ACCEPT_RETRY_DELAY, "transient accept error");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e).context("accepting forwarded connection"),
            },
        }
    }
}

/// Decodes frames from one leaf until end-of-stream or the first error.
///
/// Decoded maps go to the forwarded aggregator's merge queue. A decode error
/// is counted as `errors.forwarded_message_read` and drops only this
/// connection.
async fn decode_stream(
    mut stream: TcpStream,
    merge_tx: mpsc::Sender<HashMap<String, f64>>,
    meta: MetaSender,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = frame::read_frame(&mut stream) => match res {
                Ok(Some(counts)) => {
                    if merge_tx.send(counts).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!("leaf disconnected");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "error reading forwarded message");
                    meta.inc("errors.forwarded_message_read").await;
                    return;
                }
            },
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
