//! Process-wide registry of timers, meters and gauges
//!
//! Pull-based: consumers poll `snapshot()` and serve it however they
//! like (an HTTP metrics endpoint, a log line, a test assertion). The
//! snapshot holds the registry lock only long enough to copy state;
//! gauge suppliers run after the lock is released and are re-evaluated
//! on every export, never cached.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

type GaugeFn = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Clone, Default)]
struct TimerSeries {
    count: u64,
    sum_secs: f64,
    /// Recent samples retained for percentile estimation
    samples: Vec<f64>,
}

#[derive(Clone, Default)]
struct MeterSeries {
    count: u64,
    /// Mark timestamps within the trailing rate window
    marks: Vec<f64>,
}

enum Metric {
    Timer(TimerSeries),
    Meter(MeterSeries),
    Gauge(GaugeFn),
}

impl Metric {
    fn kind_name(&self) -> &'static str {
        match self {
            Metric::Timer(_) => "timer",
            Metric::Meter(_) => "meter",
            Metric::Gauge(_) => "gauge",
        }
    }
}

/// Thread-safe registry of named metrics
pub struct MetricsRegistry {
    metrics: RwLock<HashMap<String, Metric>>,
    /// Maximum samples retained per timer
    max_samples: usize,
    /// Trailing window for meter rates, in seconds
    rate_window_secs: f64,
    /// Monotonic time anchor (prevents clock skew issues from NTP)
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_max_samples(1024)
    }

    /// Create a registry with a custom per-timer sample bound
    pub fn with_max_samples(max_samples: usize) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            max_samples,
            rate_window_secs: 60.0,
            start_time: Instant::now(),
        }
    }

    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Append a duration sample to a named timer
    pub fn record_timer(&self, name: &str, duration: Duration) {
        let mut metrics = self.metrics.write().unwrap();
        let metric = metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Timer(TimerSeries::default()));

        match metric {
            Metric::Timer(series) => {
                series.count += 1;
                series.sum_secs += duration.as_secs_f64();
                series.samples.push(duration.as_secs_f64());

                // Drop the oldest 10% once over the bound, so cleanup is amortized
                if series.samples.len() > self.max_samples {
                    let remove_count = (self.max_samples / 10).max(1);
                    series.samples.drain(0..remove_count);
                }
            }
            other => {
                tracing::warn!(
                    name,
                    kind = other.kind_name(),
                    "timer write to non-timer metric dropped"
                );
            }
        }
    }

    /// Increment a named meter
    pub fn increment_meter(&self, name: &str) {
        let now = self.monotonic_time();
        let cutoff = now - self.rate_window_secs;

        let mut metrics = self.metrics.write().unwrap();
        let metric = metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Meter(MeterSeries::default()));

        match metric {
            Metric::Meter(series) => {
                series.count += 1;
                series.marks.push(now);
                series.marks.retain(|ts| *ts >= cutoff);
            }
            other => {
                tracing::warn!(
                    name,
                    kind = other.kind_name(),
                    "meter write to non-meter metric dropped"
                );
            }
        }
    }

    /// Register a gauge supplier under a name
    ///
    /// The supplier must be a side-effect-free read of caller-owned
    /// state; it runs outside the registry lock on every snapshot.
    /// Re-registering a name replaces the previous supplier.
    pub fn register_gauge<F>(&self, name: impl Into<String>, supplier: F)
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        let mut metrics = self.metrics.write().unwrap();
        metrics.insert(name.into(), Metric::Gauge(Arc::new(supplier)));
    }

    /// Export every metric as a flat name -> value mapping
    ///
    /// Timers export `.count`, `.mean_ms`, `.p50_ms`, `.p95_ms` and
    /// `.p99_ms`; meters export `.count` and `.m1_rate`; gauges export
    /// under their registered name.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        enum Copied {
            Timer(TimerSeries),
            Meter(MeterSeries),
            Gauge(GaugeFn),
        }

        let now = self.monotonic_time();
        let copied: Vec<(String, Copied)> = {
            let metrics = self.metrics.read().unwrap();
            metrics
                .iter()
                .map(|(name, metric)| {
                    let copy = match metric {
                        Metric::Timer(series) => Copied::Timer(series.clone()),
                        Metric::Meter(series) => Copied::Meter(series.clone()),
                        Metric::Gauge(supplier) => Copied::Gauge(supplier.clone()),
                    };
                    (name.clone(), copy)
                })
                .collect()
        };

        let mut out = BTreeMap::new();
        for (name, metric) in copied {
            match metric {
                Copied::Timer(series) => {
                    let mean_ms = if series.count > 0 {
                        series.sum_secs / series.count as f64 * 1000.0
                    } else {
                        0.0
                    };
                    let mut sorted = series.samples;
                    sorted.sort_by(|a, b| a.total_cmp(b));

                    out.insert(format!("{}.count", name), series.count as f64);
                    out.insert(format!("{}.mean_ms", name), mean_ms);
                    out.insert(format!("{}.p50_ms", name), percentile(&sorted, 50.0) * 1000.0);
                    out.insert(format!("{}.p95_ms", name), percentile(&sorted, 95.0) * 1000.0);
                    out.insert(format!("{}.p99_ms", name), percentile(&sorted, 99.0) * 1000.0);
                }
                Copied::Meter(series) => {
                    let cutoff = now - self.rate_window_secs;
                    let in_window = series.marks.iter().filter(|ts| **ts >= cutoff).count();

                    out.insert(format!("{}.count", name), series.count as f64);
                    out.insert(
                        format!("{}.m1_rate", name),
                        in_window as f64 / self.rate_window_secs,
                    );
                }
                Copied::Gauge(supplier) => {
                    out.insert(name, supplier());
                }
            }
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metrics = self.metrics.read().unwrap();
        f.debug_struct("MetricsRegistry")
            .field("metrics", &metrics.len())
            .field("max_samples", &self.max_samples)
            .finish()
    }
}

/// Nearest-rank percentile over an ascending sample slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    sorted[rank.round() as usize]
}
