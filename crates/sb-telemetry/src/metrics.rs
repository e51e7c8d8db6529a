use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metric names shared by the crates that record them.
pub mod names {
    /// Counter, label `outcome` = done | interrupted | error.
    pub const RUNS_TOTAL: &str = "runs_total";
    /// Counter, label `code` = the client-facing error code.
    pub const RUN_ERRORS_TOTAL: &str = "run_errors_total";
    /// Histogram of run wall time from submission to terminal event.
    pub const RUN_DURATION_SECONDS: &str = "run_duration_seconds";
    /// Gauge of workers currently lent out.
    pub const WORKERS_BUSY: &str = "workers_busy";
    /// Counter, label `routed` = true | false.
    pub const RELAY_TRANSCRIPTS_TOTAL: &str = "relay_transcripts_total";
    /// Counter, label `direction` = upstream | downstream.
    pub const RELAY_AUDIO_FRAMES_TOTAL: &str = "relay_audio_frames_total";
    /// Gauge of open STT upstream connections.
    pub const STT_UPSTREAMS: &str = "stt_upstreams";
    /// Counter, label `result` = ok | failed.
    pub const STT_RECONNECTS_TOTAL: &str = "stt_reconnects_total";
    /// Gauge of clients subscribed to synthesized audio.
    pub const TTS_SUBSCRIBERS: &str = "tts_subscribers";
    /// Counter, labels `method`, `path`, `status`.
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Distribution of observed values across fixed buckets.
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
        // f64 sum stored as bits
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Short-request buckets (seconds), for HTTP handlers.
fn http_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
}

/// Generation buckets (seconds); runs include queueing for a worker.
fn run_buckets() -> Vec<f64> {
    vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing members of a counter family.
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

    /// `{key="value",...}`, or empty when there are no labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process metrics. Families are registered lazily on first use; values are
/// atomics so the hot path only takes a read lock.
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

    /// Collector with the switchboard histograms and gauges pre-registered,
    /// so `/metrics` shows them before the first observation.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        {
            let mut h = write(&collector.histograms);
            h.insert(names::RUN_DURATION_SECONDS.to_string(), Histogram::new(run_buckets()));
            h.insert(
                names::HTTP_REQUEST_DURATION_SECONDS.to_string(),
                Histogram::new(http_buckets()),
            );
        }
        for gauge in [names::WORKERS_BUSY, names::STT_UPSTREAMS, names::TTS_SUBSCRIBERS] {
            collector.set_gauge(gauge, 0);
        }
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
        self.with_gauge(name, |g| g.store(value, Ordering::Relaxed));
    }

    /// Add `delta` (possibly negative) to a gauge.
    pub fn add_gauge(&self, name: &str, delta: i64) {
        self.with_gauge(name, |g| {
            g.fetch_add(delta, Ordering::Relaxed);
        });
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn with_gauge(&self, name: &str, f: impl FnOnce(&AtomicI64)) {
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(name) {
                f(g);
                return;
            }
        }
        let mut map = write(&self.gauges);
        f(map.entry(name.to_string()).or_insert_with(|| AtomicI64::new(0)));
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with HTTP buckets if unknown.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = write(&self.histograms);
        map.entry(name.to_string())
            .or_insert_with(|| Histogram::new(http_buckets()))
            .observe(value);
    }

    /// `(count, sum)` of a histogram, if registered.
    pub fn histogram_snapshot(&self, name: &str) -> Option<(u64, f64)> {
        read(&self.histograms).get(name).map(|h| (h.count(), h.sum()))
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format.
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
            let mut families: Vec<_> = grouped.into_iter().collect();
            families.sort_by(|a, b| a.0.cmp(b.0));
            for (name, mut entries) in families {
                entries.sort_by_key(|(labels, _)| labels.prometheus_str());
                out.push_str(&format!("# TYPE {name} counter\n"));
                for (labels, value) in entries {
                    out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
                }
            }
        }

        {
            let map = read(&self.gauges);
            let mut gauge_names: Vec<&String> = map.keys().collect();
            gauge_names.sort();
            for name in gauge_names {
                let val = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {name} gauge\n{name} {val}\n"));
            }
        }

        {
            let map = read(&self.histograms);
            let mut hist_names: Vec<&String> = map.keys().collect();
            hist_names.sort();
            for name in hist_names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {name} histogram\n"));
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    out.push_str(&format!("{name}_bucket{{le=\"{boundary}\"}} {cumulative}\n"));
                }
                out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.count()));
                out.push_str(&format!("{name}_sum {}\n", h.sum()));
                out.push_str(&format!("{name}_count {}\n", h.count()));
            }
        }

        out
    }

    /// Compact JSON view, served by the status endpoint.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for ((name, labels), val) in read(&self.counters).iter() {
            counters.insert(
                format!("{name}{}", labels.prometheus_str()),
                serde_json::json!(val.load(Ordering::Relaxed)),
            );
        }

        let mut gauges = serde_json::Map::new();
        for (name, val) in read(&self.gauges).iter() {
            gauges.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
        }

        let mut histograms = serde_json::Map::new();
        for (name, h) in read(&self.histograms).iter() {
            histograms.insert(
                name.clone(),
                serde_json::json!({ "count": h.count(), "sum": h.sum() }),
            );
        }

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
