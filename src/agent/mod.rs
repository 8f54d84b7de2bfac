//! Wires the whole pipeline together: queues, sockets, and one task per
//! component. Mutable state never crosses a task boundary; everything moves
//! through bounded channels.

use anyhow::{anyhow, Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregate::runner::{self, EmitSettings};
use crate::config::Config;
use crate::forward;
use crate::ingest::pool::{BufferPool, BUFFER_SIZE, NUM_BUFFERS};
use crate::ingest::{self, StatRouter};
use crate::net::{writer_loop, PersistentConn};
use crate::statsd::MetaSender;
use crate::tap::{self, TapHandle};

/// Queue depth for stats and merge bundles awaiting aggregation.
const INCOMING_QUEUE_SIZE: usize = 100;

/// Queue depth for flushed payloads awaiting a writer. Producers block on a
/// full queue, so an unreachable endpoint stalls flushing after this many
/// windows instead of growing memory.
const OUTGOING_QUEUE_SIZE: usize = 16;

/// Agent owns every background task of a statsink instance.
pub struct Agent {
    cfg: Config,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    fatal_rx: Option<oneshot::Receiver<anyhow::Error>>,
}

impl Agent {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            fatal_rx: None,
        }
    }

    /// Binds all sockets and spawns the pipeline. Bind failures are fatal.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Debug tap, so every later component can mirror into it.
        let tap = match self.cfg.debug_port {
            Some(port) => tap::start(port, self.cancel.child_token())
                .await
                .context("starting debug tap")?,
            None => TapHandle::disabled(),
        };

        // 2. Graphite writer.
        let (graphite_tx, graphite_rx) = mpsc::channel(OUTGOING_QUEUE_SIZE);
        {
            let conn = PersistentConn::new(self.cfg.graphite_addr.clone());
            let tap = tap.clone();
            self.tasks.push(tokio::spawn(writer_loop(
                conn,
                graphite_rx,
                move |payload| tap.print_payload("[out] ", payload),
                self.cancel.child_token(),
            )));
        }

        // 3. Main aggregator.
        let (stat_tx, stat_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        self.tasks.push(tokio::spawn(runner::run_main(
            stat_rx,
            graphite_tx.clone(),
            EmitSettings {
                namespace: self.cfg.namespace.clone(),
                distinct_name: "distinct_metrics_flushed",
                interval: self.cfg.flush_interval,
                percentiles: self.cfg.timer_percentiles.clone(),
                preserve_across_flushes: !self.cfg.clear_stats_between_flushes,
            },
            self.cancel.child_token(),
        )));
        let meta = MetaSender::new(stat_tx.clone());

        // 4. Leaf role: forward-marked counters go out as binary frames.
        let leaf_tx = match &self.cfg.forwarding_addr {
            Some(addr) => {
                let (fwd_stat_tx, fwd_stat_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
                let (fwd_out_tx, fwd_out_rx) = mpsc::channel(OUTGOING_QUEUE_SIZE);

                let conn = PersistentConn::new(addr.clone());
                let fwd_tap = tap.clone();
                self.tasks.push(tokio::spawn(writer_loop(
                    conn,
                    fwd_out_rx,
                    move |payload| {
                        if fwd_tap.is_active() {
                            fwd_tap.print(
                                "[forward] ",
                                &format!(
                                    "<binary forwarding message; len = {} bytes>",
                                    payload.len()
                                ),
                            );
                        }
                    },
                    self.cancel.child_token(),
                )));

                self.tasks.push(tokio::spawn(runner::run_leaf(
                    fwd_stat_rx,
                    fwd_out_tx,
                    self.cfg.flush_interval,
                    self.cancel.child_token(),
                )));

                info!(addr = %addr, "forwarding marked counters upstream");
                Some(fwd_stat_tx)
            }
            None => None,
        };

        // 5. Upstream role: accept leaf frames and merge them.
        if let Some(addr) = &self.cfg.forwarder_listen_addr {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding forwarder listener on {addr}"))?;
            info!(addr = %addr, "listening for forwarded leaf frames");

            let (merge_tx, merge_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
            self.tasks.push(tokio::spawn(runner::run_forwarded(
                merge_rx,
                graphite_tx.clone(),
                EmitSettings {
                    namespace: self.cfg.forwarded_namespace.clone(),
                    distinct_name: "distinct_forwarded_metrics_flushed",
                    interval: self.cfg.flush_interval,
                    percentiles: self.cfg.timer_percentiles.clone(),
                    preserve_across_flushes: !self.cfg.clear_stats_between_flushes,
                },
                self.cancel.child_token(),
            )));

            let upstream_meta = meta.clone();
            let upstream_cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) =
                    forward::upstream_listener(listener, merge_tx, upstream_meta, upstream_cancel)
                        .await
                {
                    error!(error = %e, "forwarder listener terminated");
                }
            }));
        }

        // 6. UDP ingress, last so nothing arrives before the queues exist.
        let socket = UdpSocket::bind(("0.0.0.0", self.cfg.port))
            .await
            .with_context(|| format!("binding UDP socket on port {}", self.cfg.port))?;
        info!(port = self.cfg.port, "listening for statsd packets");

        let pool = BufferPool::new(NUM_BUFFERS, BUFFER_SIZE);
        let router = StatRouter {
            main: stat_tx,
            leaf: leaf_tx,
            meta,
            tap,
        };

        let (fatal_tx, fatal_rx) = oneshot::channel();
        let recv_cancel = self.cancel.child_token();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = ingest::receive_loop(socket, pool, router, recv_cancel).await {
                let _ = fatal_tx.send(e);
            }
        }));
        self.fatal_rx = Some(fatal_rx);

        info!("agent fully started");

        Ok(())
    }

    /// Resolves with the error when the receive loop dies. Call after
    /// `start`.
    pub async fn fatal(&mut self) -> anyhow::Error {
        match self.fatal_rx.take() {
            Some(rx) => match rx.await {
                Ok(e) => e,
                Err(_) => anyhow!("udp receiver exited unexpectedly"),
            },
            None => std::future::pending().await,
        }
    }

    /// Signals every task to stop and waits for them, bounded.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(std::time::Duration::from_secs(5), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "task join failed"),
                Err(_) => error!("task did not stop in time"),
            }
        }
        info!("agent stopped");
    }
}
