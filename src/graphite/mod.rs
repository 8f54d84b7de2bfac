//! Graphite plain-text payload construction: one `path value timestamp`
//! line per emitted series, one payload per flush window.

use std::fmt::Write as _;
use std::time::Duration;

use crate::aggregate::BufferedStats;

/// Builds the payload for one flush window.
///
/// Series derivation per kind: counters emit `.count` (the corrected sum)
/// and `.rate` (sum per second of window); gauges emit under their bare
/// name; timers emit `.count`, `.count_ps`, `.min`, `.max`, `.mean` and an
/// `.upper_<p>` per requested percentile; sets emit `.count` (cardinality).
/// All lines share `timestamp`, the flush instant. A synthetic
/// `<namespace>.<distinct_name>` series carrying the distinct-name count is
/// always appended, even for an empty window.
///
/// Returns the distinct-name count together with the payload text.
pub fn build_payload(
    stats: &BufferedStats,
    namespace: &str,
    distinct_name: &str,
    timestamp: u64,
    window: Duration,
    percentiles: &[f64],
) -> (usize, String) {
    let window_secs = window.as_secs_f64();
    let distinct = stats.distinct_count();
    let mut out = String::new();

    for (name, &sum) in stats.counts() {
        line(&mut out, namespace, name, ".count", sum, timestamp);
        line(&mut out, namespace, name, ".rate", sum / window_secs, timestamp);
    }

    for (name, &value) in stats.gauges() {
        line(&mut out, namespace, name, "", value, timestamp);
    }

    for (name, samples) in stats.timers() {
        if samples.is_empty() {
            continue;
        }
        let mut sorted = samples.clone();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();

        line(&mut out, namespace, name, ".count", count as f64, timestamp);
        line(
            &mut out,
            namespace,
            name,
            ".count_ps",
            count as f64 / window_secs,
            timestamp,
        );
        line(&mut out, namespace, name, ".min", sorted[0], timestamp);
        line(&mut out, namespace, name, ".max", sorted[count - 1], timestamp);
        line(
            &mut out,
            namespace,
            name,
            ".mean",
            sum / count as f64,
            timestamp,
        );

        for &p in percentiles {
            let suffix = format!(".upper_{}", percentile_label(p));
            let rank = percentile_rank(count, p);
            line(&mut out, namespace, name, &suffix, sorted[rank - 1], timestamp);
        }
    }

    for (name, set) in stats.sets() {
        line(&mut out, namespace, name, ".count", set.len() as f64, timestamp);
    }

    line(
        &mut out,
        namespace,
        distinct_name,
        "",
        distinct as f64,
        timestamp,
    );

    (distinct, out)
}

fn line(out: &mut String, namespace: &str, name: &str, suffix: &str, value: f64, ts: u64) {
    if namespace.is_empty() {
        let _ = writeln!(out, "{name}{suffix} {value} {ts}");
    } else {
        let _ = writeln!(out, "{namespace}.{name}{suffix} {value} {ts}");
    }
}

/// 1-based rank of the statsd `upper_<p>` sample: `round(p/100 * n)`,
/// clamped into `[1, n]`.
fn percentile_rank(n: usize, p: f64) -> usize {
    (((p / 100.0) * n as f64).round() as usize).clamp(1, n)
}

/// Graphite-safe percentile label: `90` for 90.0, `99_9` for 99.9.
fn percentile_label(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("{}", p as u32)
    } else {
        format!("{p}").replace('.', "_")
    }
}
