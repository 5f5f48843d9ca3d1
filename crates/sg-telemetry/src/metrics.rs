use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metric names emitted by the engine.
pub mod names {
    pub const GATE_DECISIONS: &str = "stepgate_gate_decisions_total";
    pub const GATE_RESOLUTIONS: &str = "stepgate_gate_resolutions_total";
    pub const CLAIMS: &str = "stepgate_claims_total";
    pub const CONFLICTS: &str = "stepgate_conflicts_total";
    pub const ESCALATIONS: &str = "stepgate_escalations_total";
    pub const ACTIVE_RUNS: &str = "stepgate_active_runs";
    pub const GATE_LATENCY: &str = "stepgate_gate_latency_seconds";
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Distribution of observed values across fixed upper bounds.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // The sum is stored as f64 bits so it can be updated with a CAS loop.
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Buckets for short operations (seconds).
fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

/// Buckets for human response latency (seconds): 10s up to 2h.
fn gate_latency_buckets() -> Vec<f64> {
    vec![10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing members of one counter family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// `{key="value",key2="value2"}`, or an empty string without labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Thread-safe counters, gauges and histograms.
///
/// Families are registered lazily under a write lock; values are atomics so
/// the hot path only takes the read lock.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// A collector with the gate latency histogram pre-registered.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        write(&collector.histograms).insert(
            names::GATE_LATENCY.to_string(),
            Histogram::new(gate_latency_buckets()),
        );
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = write(&self.counters);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Add `delta` (possibly negative) to a gauge.
    pub fn add_gauge(&self, name: &str, delta: i64) {
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(name) {
                g.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with duration buckets if absent.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        read(&self.histograms)
            .get(name)
            .map(|h| h.get_count())
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut family_names: Vec<&str> = grouped.keys().copied().collect();
            family_names.sort_unstable();
            for name in family_names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                let mut entries = grouped[name].clone();
                entries.sort_by(|a, b| a.0.prometheus_str().cmp(&b.0.prometheus_str()));
                for (labels, value) in entries {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = read(&self.gauges);
            let mut gauge_names: Vec<&String> = map.keys().collect();
            gauge_names.sort();
            for name in gauge_names {
                out.push_str(&format!("# TYPE {} gauge\n", name));
                out.push_str(&format!("{} {}\n", name, map[name].load(Ordering::Relaxed)));
            }
        }

        {
            let map = read(&self.histograms);
            let mut hist_names: Vec<&String> = map.keys().collect();
            hist_names.sort();
            for name in hist_names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name, boundary, cumulative
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.get_count()));
                out.push_str(&format!("{}_sum {}\n", name, h.get_sum()));
                out.push_str(&format!("{}_count {}\n", name, h.get_count()));
            }
        }

        out
    }

    /// All metrics as one JSON object, for `sg status --json`.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters_json = serde_json::Map::new();
        for ((name, labels), val) in read(&self.counters).iter() {
            counters_json.insert(
                format!("{}{}", name, labels.prometheus_str()),
                serde_json::json!(val.load(Ordering::Relaxed)),
            );
        }

        let mut gauges_json = serde_json::Map::new();
        for (name, val) in read(&self.gauges).iter() {
            gauges_json.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
        }

        let mut histograms_json = serde_json::Map::new();
        for (name, h) in read(&self.histograms).iter() {
            histograms_json.insert(
                name.clone(),
                serde_json::json!({ "sum": h.get_sum(), "count": h.get_count() }),
            );
        }

        serde_json::json!({
            "counters": counters_json,
            "gauges": gauges_json,
            "histograms": histograms_json,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// The process-wide collector the engine reports into.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::with_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative_on_export() {
        let m = MetricsCollector::with_defaults();
        m.record_histogram(names::GATE_LATENCY, 5.0);
        m.record_histogram(names::GATE_LATENCY, 120.0);
        m.record_histogram(names::GATE_LATENCY, 1800.0);

        let out = m.export_prometheus();
        assert!(out.contains("stepgate_gate_latency_seconds_bucket{le=\"10\"} 1"));
        assert!(out.contains("stepgate_gate_latency_seconds_bucket{le=\"300\"} 2"));
        assert!(out.contains("stepgate_gate_latency_seconds_bucket{le=\"1800\"} 3"));
        assert!(out.contains("stepgate_gate_latency_seconds_bucket{le=\"+Inf\"} 3"));
        assert_eq!(m.histogram_count(names::GATE_LATENCY), 3);
    }

    #[test]
    fn gauge_add_goes_both_ways() {
        let m = MetricsCollector::new();
        m.add_gauge(names::ACTIVE_RUNS, 2);
        m.add_gauge(names::ACTIVE_RUNS, -1);
        assert_eq!(m.get_gauge(names::ACTIVE_RUNS), 1);
    }

    #[test]
    fn labels_sort_by_key() {
        let l = Labels::new(&[("verdict", "auto_proceed"), ("mode", "learning")]);
        assert_eq!(
            l.prometheus_str(),
            "{mode=\"learning\",verdict=\"auto_proceed\"}"
        );
        assert_eq!(Labels::empty().prometheus_str(), "");
    }

    #[test]
    fn global_metrics_is_a_singleton() {
        assert!(std::ptr::eq(global_metrics(), global_metrics()));
    }
}
