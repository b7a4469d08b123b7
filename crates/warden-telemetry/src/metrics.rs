use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metric names emitted by the warden services.
pub mod names {
    pub const AUTHORIZATION_DECISIONS: &str = "warden_authorization_decisions_total";
    pub const BYPASS_ATTEMPTS: &str = "warden_bypass_attempts_total";
    pub const HEALTH_CHECKS: &str = "warden_health_checks_total";
    pub const ALERTS_RAISED: &str = "warden_alerts_raised_total";
    pub const HEALING_ACTIONS: &str = "warden_healing_actions_total";
    pub const HEALING_PASS_DURATION: &str = "warden_healing_pass_duration_seconds";
    pub const DORMANT: &str = "warden_dormant";
    pub const CONSECUTIVE_HEALING_FAILURES: &str = "warden_consecutive_healing_failures";
    pub const SCHEDULED_TASKS: &str = "warden_scheduled_tasks";
    pub const CIRCUIT_STATE: &str = "warden_circuit_state";
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Cumulative-bucket histogram over `f64` observations.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
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
        // f64 sum stored as bits.
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(idx) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(upper bound, cumulative count)` per bucket.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.buckets
            .iter()
            .zip(&self.counts)
            .map(|(bound, c)| {
                running += c.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }
}

/// Buckets for healing passes and health checks, in seconds.
fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs distinguishing series of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    /// `{key="value",...}`, or empty for an unlabelled series.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

type SeriesKey = (String, Labels);

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges, and histograms, all keyed by name plus labels.
///
/// Series are created on first use. Reads take the read lock; only the
/// first write to a new series takes the write lock.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<SeriesKey, AtomicU64>>,
    gauges: RwLock<AHashMap<SeriesKey, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(c) = read(&self.counters).get(&key) {
            c.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
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

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(g) = read(&self.gauges).get(&key) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges)
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record a value; unknown histograms get the default duration buckets.
    pub fn record_histogram(&self, name: &str, value: f64) {
        if let Some(h) = read(&self.histograms).get(name) {
            h.observe(value);
            return;
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        read(&self.histograms).get(name).map(Histogram::count).unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, metrics sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut series: Vec<(&SeriesKey, u64)> =
                map.iter().map(|(k, v)| (k, v.load(Ordering::Relaxed))).collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            push_family(&mut out, "counter", &series);
        }

        {
            let map = read(&self.gauges);
            let mut series: Vec<(&SeriesKey, i64)> =
                map.iter().map(|(k, v)| (k, v.load(Ordering::Relaxed))).collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            push_family(&mut out, "gauge", &series);
        }

        {
            let map = read(&self.histograms);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {name} histogram\n"));
                for (bound, cumulative) in h.cumulative() {
                    out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {cumulative}\n"));
                }
                out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.count()));
                out.push_str(&format!("{name}_sum {}\n", h.sum()));
                out.push_str(&format!("{name}_count {}\n", h.count()));
            }
        }

        out
    }

    /// All series as JSON, keyed `name{labels}`.
    pub fn export_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<String, serde_json::Value> = read(&self.counters)
            .iter()
            .map(|((name, labels), v)| {
                (
                    format!("{name}{}", labels.prometheus_str()),
                    serde_json::json!(v.load(Ordering::Relaxed)),
                )
            })
            .collect();
        let gauges: serde_json::Map<String, serde_json::Value> = read(&self.gauges)
            .iter()
            .map(|((name, labels), v)| {
                (
                    format!("{name}{}", labels.prometheus_str()),
                    serde_json::json!(v.load(Ordering::Relaxed)),
                )
            })
            .collect();
        let histograms: serde_json::Map<String, serde_json::Value> = read(&self.histograms)
            .iter()
            .map(|(name, h)| {
                (
                    name.clone(),
                    serde_json::json!({ "sum": h.sum(), "count": h.count() }),
                )
            })
            .collect();

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

fn push_family<V: std::fmt::Display>(out: &mut String, kind: &str, series: &[(&SeriesKey, V)]) {
    let mut last: Option<&str> = None;
    for ((name, labels), value) in series {
        if last != Some(name.as_str()) {
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            last = Some(name.as_str());
        }
        out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
