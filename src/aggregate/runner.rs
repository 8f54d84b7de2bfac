//! The three aggregator tasks. Each owns its store outright and runs the
//! same control pattern: select between new input, the flush tick, and
//! cancellation. Flush cadence is identical across all three.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::forward::frame;
use crate::graphite;
use crate::statsd::{Stat, StatKind};

use super::BufferedStats;

/// Settings for an aggregator that emits Graphite payloads.
#[derive(Debug, Clone)]
pub struct EmitSettings {
    pub namespace: String,
    /// Name of the synthetic distinct-count series.
    pub distinct_name: &'static str,
    pub interval: Duration,
    pub percentiles: Vec<f64>,
    /// Carry gauges and sets into the next window.
    pub preserve_across_flushes: bool,
}

/// The main aggregator: applies decoded stats to the primary store and
/// emits one Graphite payload per window.
pub async fn run_main(
    mut rx: mpsc::Receiver<Stat>,
    out: mpsc::Sender<Vec<u8>>,
    settings: EmitSettings,
    cancel: CancellationToken,
) {
    let mut store = BufferedStats::new();
    let mut ticker = ticker(settings.interval).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                final_emit(&store, &settings, &out);
                return;
            }
            stat = rx.recv() => {
                let Some(stat) = stat else { return };
                apply_stat(&mut store, &stat);
            }
            _ = ticker.tick() => {
                if emit(&mut store, &settings, &out).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// The forwarded aggregator (upstream role): merges decoded leaf frames and
/// re-emits them to Graphite under the forwarded namespace.
pub async fn run_forwarded(
    mut rx: mpsc::Receiver<HashMap<String, f64>>,
    out: mpsc::Sender<Vec<u8>>,
    settings: EmitSettings,
    cancel: CancellationToken,
) {
    let mut store = BufferedStats::new();
    let mut ticker = ticker(settings.interval).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                final_emit(&store, &settings, &out);
                return;
            }
            counts = rx.recv() => {
                let Some(counts) = counts else { return };
                store.merge_counts(&counts);
            }
            _ = ticker.tick() => {
                if emit(&mut store, &settings, &out).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// The forwarding-leaf aggregator: accumulates forward-marked counters and
/// emits one binary frame per non-empty window. The leaf store is always
/// fully cleared; carryover decisions belong to the upstream end.
pub async fn run_leaf(
    mut rx: mpsc::Receiver<Stat>,
    out: mpsc::Sender<Vec<u8>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut store = BufferedStats::new();
    let mut ticker = ticker(interval).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if !store.counts().is_empty() {
                    if let Ok(f) = frame::encode(store.counts()) {
                        let _ = out.try_send(f);
                    }
                }
                return;
            }
            stat = rx.recv() => {
                let Some(stat) = stat else { return };
                if stat.kind == StatKind::Counter {
                    let _ = store.add_count(&stat.name, stat.value / stat.sample_rate);
                }
            }
            _ = ticker.tick() => {
                if store.counts().is_empty() {
                    debug!("no stats to forward");
                } else {
                    match frame::encode(store.counts()) {
                        Ok(f) => {
                            debug!(stats = store.counts().len(), "forwarding stats");
                            if out.send(f).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode forward frame"),
                    }
                }
                store.clear(false);
            }
        }
    }
}

async fn ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Consume the tick that completes immediately so the first window has
    // the full interval to accumulate.
    ticker.tick().await;
    ticker
}

fn apply_stat(store: &mut BufferedStats, stat: &Stat) {
    if let Err(conflict) = store.apply(stat) {
        debug!(
            name = %stat.name,
            existing = conflict.existing.as_str(),
            submitted = conflict.submitted.as_str(),
            "metric kind conflict",
        );
        let _ = store.add_count("errors.inconsistent_metric_type", 1.0);
    }
}

/// Builds and hands off one window's payload, then resets the store. The
/// send blocks when the writer queue is full: a flush never drops a payload.
async fn emit(
    store: &mut BufferedStats,
    settings: &EmitSettings,
    out: &mpsc::Sender<Vec<u8>>,
) -> Result<(), ()> {
    let (n, payload) = graphite::build_payload(
        store,
        &settings.namespace,
        settings.distinct_name,
        unix_now(),
        settings.interval,
        &settings.percentiles,
    );
    debug!(stats = n, "flushing to graphite");

    if out.send(payload.into_bytes()).await.is_err() {
        return Err(());
    }
    store.clear(settings.preserve_across_flushes);
    Ok(())
}

fn final_emit(store: &BufferedStats, settings: &EmitSettings, out: &mpsc::Sender<Vec<u8>>) {
    let (n, payload) = graphite::build_payload(
        store,
        &settings.namespace,
        settings.distinct_name,
        unix_now(),
        settings.interval,
        &settings.percentiles,
    );
    if out.try_send(payload.into_bytes()).is_err() {
        debug!(stats = n, "dropping final flush, writer queue unavailable");
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statsd::parse_line;

    fn settings(preserve: bool) -> EmitSettings {
        EmitSettings {
            namespace: "ns".to_string(),
            distinct_name: "distinct_metrics_flushed",
            interval: Duration::from_secs(1),
            percentiles: vec![90.0],
            preserve_across_flushes: preserve,
        }
    }

    fn stat(line: &[u8]) -> Stat {
        parse_line(line).expect("test line parses")
    }

    fn has_line(payload: &[u8], path: &str, value: &str) -> bool {
        std::str::from_utf8(payload)
            .expect("payload is utf8")
            .lines()
            .any(|l| {
                let mut parts = l.split(' ');
                parts.next() == Some(path) && parts.next() == Some(value)
            })
    }

    #[tokio::test(start_paused = true)]
    async fn test_main_runner_flushes_window_contents() {
        let (stat_tx, stat_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(run_main(stat_rx, out_tx, settings(true), cancel.clone()));

        stat_tx.send(stat(b"foo:1|c")).await.expect("send");
        stat_tx.send(stat(b"foo:2|c")).await.expect("send");

        let payload = out_rx.recv().await.expect("first window payload");
        assert!(has_line(&payload, "ns.foo.count", "3"), "payload: {payload:?}");
        assert!(has_line(&payload, "ns.distinct_metrics_flushed", "1"));

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_main_runner_gauge_carryover() {
        let (stat_tx, stat_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(run_main(stat_rx, out_tx, settings(true), cancel.clone()));

        stat_tx.send(stat(b"g:5|g")).await.expect("send");

        let first = out_rx.recv().await.expect("window 1");
        assert!(has_line(&first, "ns.g", "5"));

        // Nothing submitted in window 2; the gauge must survive.
        let second = out_rx.recv().await.expect("window 2");
        assert!(has_line(&second, "ns.g", "5"));

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_main_runner_clears_gauges_when_configured() {
        let (stat_tx, stat_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(run_main(stat_rx, out_tx, settings(false), cancel.clone()));

        stat_tx.send(stat(b"g:5|g")).await.expect("send");

        let first = out_rx.recv().await.expect("window 1");
        assert!(has_line(&first, "ns.g", "5"));

        let second = out_rx.recv().await.expect("window 2");
        assert!(!has_line(&second, "ns.g", "5"));
        assert!(has_line(&second, "ns.distinct_metrics_flushed", "0"));

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_main_runner_counts_kind_conflicts() {
        let (stat_tx, stat_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(run_main(stat_rx, out_tx, settings(true), cancel.clone()));

        stat_tx.send(stat(b"x:1|c")).await.expect("send");
        stat_tx.send(stat(b"x:1|g")).await.expect("send");

        let payload = out_rx.recv().await.expect("payload");
        assert!(has_line(&payload, "ns.x.count", "1"));
        assert!(has_line(
            &payload,
            "ns.errors.inconsistent_metric_type.count",
            "1"
        ));

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaf_runner_emits_frames_and_always_clears() {
        let (stat_tx, stat_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(run_leaf(
            stat_rx,
            out_tx,
            Duration::from_secs(1),
            cancel.clone(),
        ));

        for _ in 0..5 {
            stat_tx.send(stat(b"f|hits:1|c")).await.expect("send");
        }

        let encoded = out_rx.recv().await.expect("frame");
        let mut cursor = encoded.as_slice();
        let counts = frame::read_frame(&mut cursor)
            .await
            .expect("decode")
            .expect("one frame");
        assert_eq!(counts["hits"], 5.0);

        // The next window is empty: no frame may be sent, so a subsequent
        // counter must arrive in a frame of its own.
        stat_tx.send(stat(b"f|later:1|c")).await.expect("send");
        let encoded = out_rx.recv().await.expect("frame");
        let mut cursor = encoded.as_slice();
        let counts = frame::read_frame(&mut cursor)
            .await
            .expect("decode")
            .expect("one frame");
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["later"], 1.0);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaf_runner_applies_sample_rate() {
        let (stat_tx, stat_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tokio::spawn(run_leaf(
            stat_rx,
            out_tx,
            Duration::from_secs(1),
            cancel.clone(),
        ));

        stat_tx.send(stat(b"f|hits:1|c|@0.5")).await.expect("send");

        let encoded = out_rx.recv().await.expect("frame");
        let mut cursor = encoded.as_slice();
        let counts = frame::read_frame(&mut cursor)
            .await
            .expect("decode")
            .expect("one frame");
        assert_eq!(counts["hits"], 2.0);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_runner_merges_and_emits() {
        let (merge_tx, merge_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let fwd_settings = EmitSettings {
            namespace: "fwd".to_string(),
            distinct_name: "distinct_forwarded_metrics_flushed",
            interval: Duration::from_secs(1),
            percentiles: Vec::new(),
            preserve_across_flushes: true,
        };
        tokio::spawn(run_forwarded(merge_rx, out_tx, fwd_settings, cancel.clone()));

        let mut one = HashMap::new();
        one.insert("hits".to_owned(), 3.0);
        let mut two = HashMap::new();
        two.insert("hits".to_owned(), 2.0);

        merge_tx.send(one).await.expect("send");
        merge_tx.send(two).await.expect("send");

        let payload = out_rx.recv().await.expect("payload");
        assert!(has_line(&payload, "fwd.hits.count", "5"));
        assert!(has_line(&payload, "fwd.distinct_forwarded_metrics_flushed", "1"));

        cancel.cancel();
    }
}
