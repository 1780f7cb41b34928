//! Metrics port and in-memory implementation (C5).
//!
//! Mirrors the shape of the bus/kv/registry/discovery ports: a trait any
//! adapter can implement (`MetricsSink`), and a dependency-free in-memory
//! default good enough for a single process's `/healthz`-style snapshot.
//! There is no background flush loop and no network egress here — a
//! Prometheus or StatsD exporter is a second `MetricsSink` impl outside this
//! crate, not a mode of this one.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A sink for counters, gauges, and timed/recorded summary values.
///
/// `&self` methods only: every implementation is expected to be internally
/// synchronized (the in-memory default uses `RwLock`s) so it can be shared
/// behind an `Arc` across tasks without a wrapping mutex at the call site.
pub trait MetricsSink: Send + Sync {
    /// Increments a named counter by `value`.
    fn increment(&self, name: &str, value: u64);

    /// Sets a named gauge to `value`, replacing whatever was there.
    fn gauge(&self, name: &str, value: f64);

    /// Records a single observation into a named summary (e.g. a latency
    /// sample in milliseconds).
    fn record(&self, name: &str, value: f64);

    /// Returns a snapshot of everything recorded so far.
    fn snapshot(&self) -> MetricsSnapshot;

    /// Clears all counters, gauges, and summaries. Does not reset uptime.
    fn reset(&self);
}

/// RAII scope that records its own elapsed wall-clock time (in
/// milliseconds) into a summary named `name` when dropped, whether the
/// scope exited normally or via unwind.
pub struct Timer<'a> {
    sink: &'a dyn MetricsSink,
    name: String,
    start: Instant,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.sink.record(&self.name, elapsed_ms);
    }
}

/// Starts a [`Timer`] scoped to `name` against `sink`.
pub fn timer<'a>(sink: &'a dyn MetricsSink, name: impl Into<String>) -> Timer<'a> {
    Timer {
        sink,
        name: name.into(),
        start: Instant::now(),
    }
}

/// Running statistics for one summary metric: count, min, max, mean, and
/// the p50/p90/p99 percentiles computed over every recorded sample.
#[derive(Debug, Clone, Default)]
struct Summary {
    count: u64,
    total: f64,
    min: f64,
    max: f64,
    values: Vec<f64>,
}

impl Summary {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.total += value;
        self.values.push(value);
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    /// `p` in `[0, 100]`. Nearest-rank on a sorted copy of the samples.
    fn percentile(&self, p: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let index = ((p / 100.0) * sorted.len() as f64) as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    fn to_stats(&self) -> SummaryStats {
        SummaryStats {
            count: self.count,
            average: round2(self.average()),
            min: if self.count > 0 { round2(self.min) } else { 0.0 },
            max: if self.count > 0 { round2(self.max) } else { 0.0 },
            p50: round2(self.percentile(50.0)),
            p90: round2(self.percentile(90.0)),
            p99: round2(self.percentile(99.0)),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percentile/count/min/max/average for one summary metric, as returned in
/// a [`MetricsSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub count: u64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// A point-in-time read of every counter, gauge, and summary, plus the
/// sink's uptime in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub summaries: HashMap<String, SummaryStats>,
}

/// Dependency-free [`MetricsSink`] backed by `std::sync::RwLock`-guarded
/// maps. Safe to construct once per process and share via `Arc`.
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    summaries: RwLock<HashMap<String, Summary>>,
    started_at: Instant,
}

impl Default for InMemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            summaries: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, value: u64) {
        let mut counters = self.counters.write().expect("metrics counters lock poisoned");
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    fn gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.write().expect("metrics gauges lock poisoned");
        gauges.insert(name.to_string(), value);
    }

    fn record(&self, name: &str, value: f64) {
        let mut summaries = self.summaries.write().expect("metrics summaries lock poisoned");
        summaries.entry(name.to_string()).or_default().add(value);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.read().expect("metrics counters lock poisoned");
        let gauges = self.gauges.read().expect("metrics gauges lock poisoned");
        let summaries = self.summaries.read().expect("metrics summaries lock poisoned");
        MetricsSnapshot {
            uptime_seconds: round2(self.started_at.elapsed().as_secs_f64()),
            counters: counters.clone(),
            gauges: gauges.clone(),
            summaries: summaries.iter().map(|(k, v)| (k.clone(), v.to_stats())).collect(),
        }
    }

    fn reset(&self) {
        self.counters.write().expect("metrics counters lock poisoned").clear();
        self.gauges.write().expect("metrics gauges lock poisoned").clear();
        self.summaries.write().expect("metrics summaries lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_accumulates() {
        let m = InMemoryMetrics::new();
        m.increment("rpc.calls", 1);
        m.increment("rpc.calls", 2);
        assert_eq!(m.snapshot().counters["rpc.calls"], 3);
    }

    #[test]
    fn gauge_replaces() {
        let m = InMemoryMetrics::new();
        m.gauge("pool.size", 4.0);
        m.gauge("pool.size", 7.0);
        assert_eq!(m.snapshot().gauges["pool.size"], 7.0);
    }

    #[test]
    fn record_builds_summary_stats() {
        let m = InMemoryMetrics::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            m.record("rpc.latency_ms", v);
        }
        let snap = m.snapshot();
        let s = snap.summaries["rpc.latency_ms"];
        assert_eq!(s.count, 5);
        assert_eq!(s.min, 10.0);
        assert_eq!(s.max, 50.0);
        assert_eq!(s.average, 30.0);
    }

    #[test]
    fn empty_summary_has_zeroed_stats() {
        let s = Summary::default();
        let stats = s.to_stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.average, 0.0);
        assert_eq!(stats.p50, 0.0);
    }

    #[test]
    fn timer_records_elapsed_on_drop() {
        let m = InMemoryMetrics::new();
        {
            let _t = timer(&m, "op.duration_ms");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let snap = m.snapshot();
        let s = snap.summaries["op.duration_ms"];
        assert_eq!(s.count, 1);
        assert!(s.average >= 4.0);
    }

    #[test]
    fn reset_clears_counters_gauges_and_summaries_but_not_uptime() {
        let m = InMemoryMetrics::new();
        m.increment("a", 1);
        m.gauge("b", 1.0);
        m.record("c", 1.0);
        m.reset();
        let snap = m.snapshot();
        assert!(snap.counters.is_empty());
        assert!(snap.gauges.is_empty());
        assert!(snap.summaries.is_empty());
    }

    #[test]
    fn snapshot_uptime_is_monotonic() {
        let m = InMemoryMetrics::new();
        let first = m.snapshot().uptime_seconds;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = m.snapshot().uptime_seconds;
        assert!(second >= first);
    }
}
