use ahash::AHashMap as HashMap;
use netpol_dataplane_core::IpSet;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::time::Duration;

/// Membership and flush metrics for the set manager.
///
/// The membership gauges are recomputed from the registry only after a
/// successful flush, so a failed flush never leaves them describing state the
/// host has not observed.
#[derive(Clone, Debug)]
pub struct SetMetrics {
    /// Number of sets in the registry.
    num_sets: Gauge,

    /// Total entries across all sets.
    num_entries: Gauge,

    /// Entries per set, labeled by set name.
    entries: Family<SetLabels, Gauge>,

    /// Backend operations issued by flushes.
    flush_ops: Counter,

    /// Flush latency, in seconds.
    flush_duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SetLabels {
    set: String,
}

// === impl SetMetrics ===

impl SetMetrics {
    pub fn new() -> Self {
        Self {
            num_sets: Gauge::default(),
            num_entries: Gauge::default(),
            entries: Family::default(),
            flush_ops: Counter::default(),
            flush_duration: Histogram::new(
                [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0].iter().copied(),
            ),
        }
    }

    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::new();
        reg.register(
            "ipset_count",
            "The number of sets in the manager registry",
            metrics.num_sets.clone(),
        );
        reg.register(
            "ipset_entry_count",
            "The total number of entries across all sets",
            metrics.num_entries.clone(),
        );
        reg.register(
            "ipset_entries",
            "The number of entries in a set",
            metrics.entries.clone(),
        );
        reg.register(
            "ipset_flush_ops",
            "Total set operations issued to the enforcement backend",
            metrics.flush_ops.clone(),
        );
        reg.register(
            "ipset_flush_duration_seconds",
            "Time spent flushing dirty sets to the enforcement backend",
            metrics.flush_duration.clone(),
        );
        metrics
    }

    pub(crate) fn incr_flush_op(&self) {
        self.flush_ops.inc();
    }

    /// Brings the membership gauges up to date after the host converged.
    /// `touched` names the sets this flush materialized or destroyed.
    pub(crate) fn record_flush(
        &self,
        elapsed: Duration,
        sets: &HashMap<String, IpSet>,
        touched: &[String],
    ) {
        self.flush_duration.observe(elapsed.as_secs_f64());
        self.num_sets.set(sets.len() as i64);
        self.num_entries
            .set(sets.values().map(|s| s.len() as i64).sum());
        for name in touched {
            let labels = SetLabels { set: name.clone() };
            match sets.get(name) {
                Some(set) => {
                    self.entries.get_or_create(&labels).set(set.len() as i64);
                }
                None => {
                    self.entries.remove(&labels);
                }
            }
        }
    }
}

impl Default for SetMetrics {
    fn default() -> Self {
        Self::new()
    }
}
