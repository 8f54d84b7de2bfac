//! Per-window aggregation stores. Each store is owned by exactly one
//! aggregator task; nothing here is shared or locked.

pub mod runner;

use std::collections::{HashMap, HashSet};

use crate::statsd::{Stat, StatKind};

/// A metric name was submitted under a different kind than earlier in the
/// same window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindConflict {
    pub existing: StatKind,
    pub submitted: StatKind,
}

/// The in-memory aggregation store: typed accumulators keyed by metric name.
///
/// A name belongs to one kind for the lifetime of a window; submissions under
/// a conflicting kind are rejected. Counters accumulate sample-rate-corrected
/// sums, gauges keep the last write, timers keep every sample, sets keep
/// distinct values exactly (by bit pattern).
#[derive(Debug, Default)]
pub struct BufferedStats {
    kinds: HashMap<String, StatKind>,
    counts: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    timers: HashMap<String, Vec<f64>>,
    sets: HashMap<String, HashSet<u64>>,
}

impl BufferedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one decoded stat. Counters are corrected by their sample rate
    /// here, at ingest, never at flush.
    pub fn apply(&mut self, stat: &Stat) -> Result<(), KindConflict> {
        match stat.kind {
            StatKind::Counter => self.add_count(&stat.name, stat.value / stat.sample_rate),
            StatKind::Gauge => self.set_gauge(&stat.name, stat.value),
            StatKind::Timer => self.record_timer(&stat.name, stat.value),
            StatKind::Set => self.add_set_item(&stat.name, stat.value),
        }
    }

    /// Adds to a counter's running sum. `delta` must already be
    /// sample-rate corrected.
    pub fn add_count(&mut self, name: &str, delta: f64) -> Result<(), KindConflict> {
        self.register(name, StatKind::Counter)?;
        *self.counts.entry(name.to_owned()).or_insert(0.0) += delta;
        Ok(())
    }

    /// Last write wins.
    pub fn set_gauge(&mut self, name: &str, value: f64) -> Result<(), KindConflict> {
        self.register(name, StatKind::Gauge)?;
        self.gauges.insert(name.to_owned(), value);
        Ok(())
    }

    /// Appends one timer sample.
    pub fn record_timer(&mut self, name: &str, value: f64) -> Result<(), KindConflict> {
        self.register(name, StatKind::Timer)?;
        self.timers.entry(name.to_owned()).or_default().push(value);
        Ok(())
    }

    /// Inserts a value into a set. Distinctness is exact, by f64 bit pattern.
    pub fn add_set_item(&mut self, name: &str, value: f64) -> Result<(), KindConflict> {
        self.register(name, StatKind::Set)?;
        self.sets
            .entry(name.to_owned())
            .or_default()
            .insert(value.to_bits());
        Ok(())
    }

    /// Additively merges a decoded leaf frame into the counter map.
    pub fn merge_counts(&mut self, counts: &HashMap<String, f64>) {
        for (name, &sum) in counts {
            // Cannot conflict in a counters-only store; ignore the result so
            // a hostile frame cannot wedge the merge loop.
            let _ = self.add_count(name, sum);
        }
    }

    /// Number of distinct metric names aggregated this window.
    pub fn distinct_count(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn counts(&self) -> &HashMap<String, f64> {
        &self.counts
    }

    pub fn gauges(&self) -> &HashMap<String, f64> {
        &self.gauges
    }

    pub fn timers(&self) -> &HashMap<String, Vec<f64>> {
        &self.timers
    }

    pub fn sets(&self) -> &HashMap<String, HashSet<u64>> {
        &self.sets
    }

    /// Resets the store at a flush boundary. Counters and timers are always
    /// dropped (their emissions are rates over one window). Gauges and sets
    /// survive when `preserve_gauges_and_sets` is true, along with their kind
    /// registrations.
    pub fn clear(&mut self, preserve_gauges_and_sets: bool) {
        self.counts.clear();
        self.timers.clear();

        if preserve_gauges_and_sets {
            self.kinds
                .retain(|_, kind| matches!(kind, StatKind::Gauge | StatKind::Set));
        } else {
            self.gauges.clear();
            self.sets.clear();
            self.kinds.clear();
        }
    }

    fn register(&mut self, name: &str, kind: StatKind) -> Result<(), KindConflict> {
        match self.kinds.get(name) {
            Some(&existing) if existing != kind => Err(KindConflict {
                existing,
                submitted: kind,
            }),
            Some(_) => Ok(()),
            None => {
                self.kinds.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statsd::parse_line;

    fn apply(store: &mut BufferedStats, line: &[u8]) -> Result<(), KindConflict> {
        let stat = parse_line(line).expect("test line parses");
        store.apply(&stat)
    }

    #[test]
    fn test_counter_sums_with_sample_rate_correction() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"foo:1|c").unwrap();
        apply(&mut store, b"foo:2|c").unwrap();
        assert_eq!(store.counts()["foo"], 3.0);

        for _ in 0..10 {
            apply(&mut store, b"hits:1|c|@0.1").unwrap();
        }
        let sum = store.counts()["hits"];
        assert!((sum - 100.0).abs() < 1e-9, "got {sum}");
    }

    #[test]
    fn test_gauge_last_write_wins() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"g:5|g").unwrap();
        apply(&mut store, b"g:7|g").unwrap();
        apply(&mut store, b"g:6|g").unwrap();
        assert_eq!(store.gauges()["g"], 6.0);
    }

    #[test]
    fn test_timer_keeps_every_sample() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"t:10|ms").unwrap();
        apply(&mut store, b"t:20|ms").unwrap();
        apply(&mut store, b"t:10|ms").unwrap();
        assert_eq!(store.timers()["t"], vec![10.0, 20.0, 10.0]);
    }

    #[test]
    fn test_set_cardinality_is_exact() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"u:1|s").unwrap();
        apply(&mut store, b"u:2|s").unwrap();
        apply(&mut store, b"u:1|s").unwrap();
        assert_eq!(store.sets()["u"].len(), 2);

        // Distinctness is bit-exact: -0.0 and 0.0 differ.
        apply(&mut store, b"z:0|s").unwrap();
        apply(&mut store, b"z:-0|s").unwrap();
        assert_eq!(store.sets()["z"].len(), 2);
    }

    #[test]
    fn test_kind_conflict_rejected_on_second_submission() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"x:1|c").unwrap();

        let err = apply(&mut store, b"x:1|g").unwrap_err();
        assert_eq!(err.existing, StatKind::Counter);
        assert_eq!(err.submitted, StatKind::Gauge);

        // The store keeps the original registration.
        apply(&mut store, b"x:2|c").unwrap();
        assert_eq!(store.counts()["x"], 3.0);
    }

    #[test]
    fn test_distinct_count_spans_all_kinds() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"a:1|c").unwrap();
        apply(&mut store, b"b:1|g").unwrap();
        apply(&mut store, b"c:1|ms").unwrap();
        apply(&mut store, b"d:1|s").unwrap();
        apply(&mut store, b"a:1|c").unwrap();
        assert_eq!(store.distinct_count(), 4);
    }

    #[test]
    fn test_clear_preserving_keeps_gauges_and_sets() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"c:1|c").unwrap();
        apply(&mut store, b"t:1|ms").unwrap();
        apply(&mut store, b"g:5|g").unwrap();
        apply(&mut store, b"u:1|s").unwrap();

        store.clear(true);

        assert!(store.counts().is_empty());
        assert!(store.timers().is_empty());
        assert_eq!(store.gauges()["g"], 5.0);
        assert_eq!(store.sets()["u"].len(), 1);
        assert_eq!(store.distinct_count(), 2);

        // A preserved name keeps its kind registration.
        let err = apply(&mut store, b"g:1|c").unwrap_err();
        assert_eq!(err.existing, StatKind::Gauge);
    }

    #[test]
    fn test_clear_dropping_empties_everything() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"c:1|c").unwrap();
        apply(&mut store, b"g:5|g").unwrap();
        apply(&mut store, b"u:1|s").unwrap();

        store.clear(false);

        assert!(store.is_empty());
        assert_eq!(store.distinct_count(), 0);

        // Freed names can re-register under any kind.
        apply(&mut store, b"g:1|c").unwrap();
    }

    #[test]
    fn test_merge_counts_is_additive() {
        let mut store = BufferedStats::new();
        apply(&mut store, b"hits:3|c").unwrap();

        let mut incoming = HashMap::new();
        incoming.insert("hits".to_owned(), 2.0);
        incoming.insert("misses".to_owned(), 1.0);
        store.merge_counts(&incoming);

        assert_eq!(store.counts()["hits"], 5.0);
        assert_eq!(store.counts()["misses"], 1.0);
        assert_eq!(store.distinct_count(), 2);
    }
}
