use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Write as _;

const DEFAULT_HISTOGRAM_BUCKETS: &[f64] = &[5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Default)]
struct Histogram {
    buckets: Vec<(f64, u64)>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: DEFAULT_HISTOGRAM_BUCKETS.iter().map(|b| (*b, 0)).collect(),
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (bound, count) in self.buckets.iter_mut() {
            if value <= *bound {
                *count += 1;
            }
        }
    }
}

enum Metric {
    Counter(std::sync::atomic::AtomicU64),
    Gauge(Mutex<f64>),
    Histogram(Mutex<Histogram>),
}

impl Metric {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Metric::Counter(std::sync::atomic::AtomicU64::new(0)),
            MetricKind::Gauge => Metric::Gauge(Mutex::new(0.0)),
            MetricKind::Histogram => Metric::Histogram(Mutex::new(Histogram::new())),
        }
    }
}

/// A metric declares a fixed set of label names at registration; each
/// distinct combination of label values gets its own value slot, keyed by
/// the ordered label values joined against `label_names`.
struct Registered {
    kind: MetricKind,
    help: String,
    label_names: Vec<String>,
    series: DashMap<Vec<String>, Metric>,
}

impl Registered {
    fn new(kind: MetricKind, help: &str, label_names: Vec<String>) -> Self {
        Self {
            kind,
            help: help.to_string(),
            label_names,
            series: DashMap::new(),
        }
    }

    /// Resolves `labels` (given in the order matching `label_names`) to a
    /// value slot, creating it on first use. Uses the entry API so two
    /// concurrent first-writers for the same label combination can't clobber
    /// each other's slot (a plain get-then-insert would let the second
    /// insert reset the first writer's counter back to zero).
    fn slot(&self, labels: &[&str]) -> dashmap::mapref::one::Ref<'_, Vec<String>, Metric> {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.series
            .entry(key)
            .or_insert_with(|| Metric::new(self.kind))
            .downgrade()
    }

    fn label_key(&self, labels: &[&str]) -> String {
        if self.label_names.is_empty() {
            return String::new();
        }
        self.label_names
            .iter()
            .zip(labels.iter())
            .map(|(name, value)| format!("{name}=\"{value}\""))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Process-wide metric registry: Counter/Gauge/Histogram with a help string
/// and a declared label schema, exported either as Prometheus text exposition
/// format or as JSON for the `/stats` endpoint. A fixed set of core metrics
/// is registered at startup (see `register_core_metrics`); callers may
/// register more for their own label schemas.
#[derive(Default)]
pub struct MetricsRegistry {
    metrics: DashMap<String, Registered>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a metric with no labels.
    pub fn register(&self, name: &str, kind: MetricKind, help: &str) {
        self.register_with_labels(name, kind, help, &[]);
    }

    /// Registers a metric whose value is split by the given label names.
    /// Re-registering an existing name replaces it (used by hot-reload-style
    /// tests); production startup registers each name exactly once.
    pub fn register_with_labels(&self, name: &str, kind: MetricKind, help: &str, label_names: &[&str]) {
        self.metrics.insert(
            name.to_string(),
            Registered::new(kind, help, label_names.iter().map(|s| s.to_string()).collect()),
        );
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.metrics.remove(name).is_some()
    }

    pub fn increment(&self, name: &str, by: u64) {
        self.increment_labeled(name, &[], by);
    }

    pub fn increment_labeled(&self, name: &str, labels: &[&str], by: u64) {
        if let Some(entry) = self.metrics.get(name) {
            if let Metric::Counter(counter) = &*entry.slot(labels) {
                counter.fetch_add(by, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.set_gauge_labeled(name, &[], value);
    }

    pub fn set_gauge_labeled(&self, name: &str, labels: &[&str], value: f64) {
        if let Some(entry) = self.metrics.get(name) {
            if let Metric::Gauge(gauge) = &*entry.slot(labels) {
                *gauge.lock() = value;
            }
        }
    }

    pub fn observe(&self, name: &str, value: f64) {
        self.observe_labeled(name, &[], value);
    }

    pub fn observe_labeled(&self, name: &str, labels: &[&str], value: f64) {
        if let Some(entry) = self.metrics.get(name) {
            if let Metric::Histogram(hist) = &*entry.slot(labels) {
                hist.lock().observe(value);
            }
        }
    }

    /// Registers the metrics every deployment needs regardless of which
    /// optional features (cache, rate limiting) are enabled.
    pub fn register_core_metrics(&self) {
        self.register("signal_hub_requests_total", MetricKind::Counter, "Total requests handled");
        self.register_with_labels(
            "signal_hub_cache_hits_total",
            MetricKind::Counter,
            "Total cache hits",
            &["cache_type"],
        );
        self.register_with_labels(
            "signal_hub_cache_misses_total",
            MetricKind::Counter,
            "Total cache misses",
            &["cache_type"],
        );
        self.register(
            "signal_hub_rate_limited_total",
            MetricKind::Counter,
            "Total requests rejected by rate limiting",
        );
        self.register(
            "signal_hub_ledger_drops_total",
            MetricKind::Counter,
            "Total usage records dropped when the cost ledger channel stayed full past its send timeout",
        );
        self.register(
            "signal_hub_request_latency_ms",
            MetricKind::Histogram,
            "Request latency in milliseconds",
        );
        self.register_with_labels(
            "signal_hub_tier_decisions_total",
            MetricKind::Counter,
            "Routing decisions by tier",
            &["tier"],
        );
        self.register("signal_hub_cache_size", MetricKind::Gauge, "Current number of cache entries");
        self.register_with_labels(
            "signal_hub_cache_hit_rate",
            MetricKind::Gauge,
            "Rolling cache hit rate over the trailing lookup window",
            &["cache_type"],
        );
    }

    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        for entry in self.metrics.iter() {
            let name = entry.key();
            let registered = entry.value();
            let type_str = match registered.kind {
                MetricKind::Counter => "counter",
                MetricKind::Gauge => "gauge",
                MetricKind::Histogram => "histogram",
            };
            let _ = writeln!(out, "# HELP {name} {}", registered.help);
            let _ = writeln!(out, "# TYPE {name} {type_str}");
            for series in registered.series.iter() {
                let labels: Vec<&str> = series.key().iter().map(|s| s.as_str()).collect();
                let label_str = registered.label_key(&labels);
                let suffix = if label_str.is_empty() {
                    String::new()
                } else {
                    format!("{{{label_str}}}")
                };
                match series.value() {
                    Metric::Counter(c) => {
                        let _ = writeln!(out, "{name}{suffix} {}", c.load(std::sync::atomic::Ordering::Relaxed));
                    }
                    Metric::Gauge(g) => {
                        let _ = writeln!(out, "{name}{suffix} {}", *g.lock());
                    }
                    Metric::Histogram(h) => {
                        let hist = h.lock();
                        for (bound, count) in &hist.buckets {
                            let bucket_labels = if label_str.is_empty() {
                                format!("le=\"{bound}\"")
                            } else {
                                format!("{label_str},le=\"{bound}\"")
                            };
                            let _ = writeln!(out, "{name}_bucket{{{bucket_labels}}} {count}");
                        }
                        let inf_labels = if label_str.is_empty() {
                            "le=\"+Inf\"".to_string()
                        } else {
                            format!("{label_str},le=\"+Inf\"")
                        };
                        let _ = writeln!(out, "{name}_bucket{{{inf_labels}}} {}", hist.count);
                        let _ = writeln!(out, "{name}_sum{suffix} {}", hist.sum);
                        let _ = writeln!(out, "{name}_count{suffix} {}", hist.count);
                    }
                }
            }
        }
        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for entry in self.metrics.iter() {
            let registered = entry.value();
            // Unlabeled metrics collapse to a scalar for ergonomic lookups;
            // labeled metrics export one object per observed label combination.
            if registered.label_names.is_empty() {
                if let Some(series) = registered.series.get(&Vec::new()) {
                    map.insert(entry.key().clone(), snapshot_value(series.value()));
                } else {
                    map.insert(entry.key().clone(), snapshot_value(&Metric::new(registered.kind)));
                }
                continue;
            }
            let mut by_label = serde_json::Map::new();
            for series in registered.series.iter() {
                let labels: Vec<&str> = series.key().iter().map(|s| s.as_str()).collect();
                let key = registered.label_key(&labels);
                by_label.insert(key, snapshot_value(series.value()));
            }
            map.insert(entry.key().clone(), serde_json::Value::Object(by_label));
        }
        serde_json::Value::Object(map)
    }
}

fn snapshot_value(metric: &Metric) -> serde_json::Value {
    match metric {
        Metric::Counter(c) => serde_json::json!(c.load(std::sync::atomic::Ordering::Relaxed)),
        Metric::Gauge(g) => serde_json::json!(*g.lock()),
        Metric::Histogram(h) => {
            let hist = h.lock();
            serde_json::json!(HistogramSnapshot {
                count: hist.count,
                sum: hist.sum,
                avg: if hist.count == 0 { 0.0 } else { hist.sum / hist.count as f64 },
            })
        }
    }
}

#[derive(Serialize)]
struct HistogramSnapshot {
    count: u64,
    sum: f64,
    avg: f64,
}
