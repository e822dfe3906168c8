//! Object pools & metrics (spec.md §4.10, §5 "Object pools").
//!
//! The histogram is a direct generalization of
//! `performance::latency::LatencyHistogram` from the teacher crate:
//! logarithmic microsecond buckets, O(log n) bucket lookup, summary
//! serialization. Counters follow the `AtomicU64` struct-of-counters style
//! from `vault::unified_15m_strategy::StrategyMetrics` and
//! `edge::receiver::EdgeReceiverStats`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Logarithmic-bucket latency histogram, covering ~1us to 10s.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: Mutex<HistogramInner>,
}

#[derive(Debug)]
struct HistogramInner {
    buckets: Vec<u64>,
    count: u64,
    sum_us: u64,
    min_us: u64,
    max_us: u64,
}

static BUCKET_BOUNDS_US: &[u64] = &[
    1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000,
    200_000, 500_000, 1_000_000, 2_000_000, 5_000_000, 10_000_000, u64::MAX,
];

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HistogramInner {
                buckets: vec![0u64; BUCKET_BOUNDS_US.len()],
                count: 0,
                sum_us: 0,
                min_us: u64::MAX,
                max_us: 0,
            }),
        }
    }

    #[inline]
    pub fn record_us(&self, latency_us: u64) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        inner.sum_us = inner.sum_us.saturating_add(latency_us);
        inner.min_us = inner.min_us.min(latency_us);
        inner.max_us = inner.max_us.max(latency_us);
        let idx = BUCKET_BOUNDS_US.partition_point(|&b| b < latency_us);
        let idx = idx.min(inner.buckets.len() - 1);
        inner.buckets[idx] += 1;
    }

    #[inline]
    pub fn record(&self, d: std::time::Duration) {
        self.record_us(d.as_micros() as u64);
    }

    pub fn percentile(&self, p: f64) -> u64 {
        let inner = self.inner.lock();
        if inner.count == 0 {
            return 0;
        }
        let target = ((p / 100.0) * inner.count as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in inner.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return BUCKET_BOUNDS_US[i];
            }
        }
        inner.max_us
    }

    pub fn p50(&self) -> u64 {
        self.percentile(50.0)
    }
    pub fn p95(&self) -> u64 {
        self.percentile(95.0)
    }
    pub fn p99(&self) -> u64 {
        self.percentile(99.0)
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    pub fn summary(&self, name: &str) -> HistogramSummary {
        let inner = self.inner.lock();
        HistogramSummary {
            name: name.to_string(),
            count: inner.count,
            min_us: if inner.count == 0 { 0 } else { inner.min_us },
            max_us: inner.max_us,
            p50_us: self.percentile(50.0),
            p95_us: self.percentile(95.0),
            p99_us: self.percentile(99.0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSummary {
    pub name: String,
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Counters and histograms enumerated in spec.md §6 ("Emitted events" /
/// Metrics). Kept as a plain struct of atomics rather than a global
/// singleton per spec.md §9 — the engine owns one instance and hands out
/// `&Metrics` to every component at construction.
#[derive(Debug, Default)]
pub struct Metrics {
    pub events_processed: CounterMap,
    pub trades_total: CounterMap,
    pub buffer_overflows_total: CounterMap,
    pub opportunities_detected_total: CounterMap,
    pub stop_loss_triggered_total: CounterMap,
    pub liquidations_detected_total: CounterMap,

    pub active_arbitrages: AtomicI64,

    tick_to_order_latency: Mutex<HashMap<String, LatencyHistogram>>,
    price_update_latency: Mutex<HashMap<String, LatencyHistogram>>,
    order_execution_latency: Mutex<HashMap<String, LatencyHistogram>>,
    spread_observed: Mutex<HashMap<String, LatencyHistogram>>,
}

/// A concurrent map of named counters, keyed by an arbitrary label (symbol,
/// venue, result, ...), mirroring the `{label=value}` metric-family idiom
/// spec.md §6 describes.
#[derive(Debug, Default)]
pub struct CounterMap {
    inner: Mutex<HashMap<String, AtomicU64>>,
}

impl CounterMap {
    pub fn incr(&self, key: &str) {
        self.incr_by(key, 1);
    }

    pub fn incr_by(&self, key: &str, n: u64) {
        let inner = self.inner.lock();
        if let Some(c) = inner.get(key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        drop(inner);
        let mut inner = self.inner.lock();
        inner
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> u64 {
        self.inner
            .lock()
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick_to_order(&self, symbol: &str, stage: &str, d: std::time::Duration) {
        let key = format!("{symbol}:{stage}");
        self.with_histogram(&self.tick_to_order_latency, &key, |h| h.record(d));
    }

    pub fn record_price_update_latency(&self, symbol: &str, d: std::time::Duration) {
        self.with_histogram(&self.price_update_latency, symbol, |h| h.record(d));
    }

    pub fn record_order_execution_latency(&self, venue: &str, side: &str, d: std::time::Duration) {
        let key = format!("{venue}:{side}");
        self.with_histogram(&self.order_execution_latency, &key, |h| h.record(d));
    }

    pub fn record_spread_observed(&self, symbol: &str, spread_pct: f64) {
        // Spread distribution is tracked in hundredths of a bp for histogram
        // bucket resolution (spread_pct is typically < 1.0).
        let micros = (spread_pct.abs() * 1_000_000.0).round().max(0.0) as u64;
        self.with_histogram(&self.spread_observed, symbol, |h| h.record_us(micros));
    }

    fn with_histogram(
        &self,
        map: &Mutex<HashMap<String, LatencyHistogram>>,
        key: &str,
        f: impl FnOnce(&LatencyHistogram),
    ) {
        {
            let guard = map.lock();
            if let Some(h) = guard.get(key) {
                f(h);
                return;
            }
        }
        let mut guard = map.lock();
        let h = guard
            .entry(key.to_string())
            .or_insert_with(LatencyHistogram::new);
        f(h);
    }

    pub fn active_arbitrages(&self) -> i64 {
        self.active_arbitrages.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> MetricsReport {
        let dump = |m: &Mutex<HashMap<String, LatencyHistogram>>| -> Vec<HistogramSummary> {
            m.lock().iter().map(|(k, h)| h.summary(k)).collect()
        };
        MetricsReport {
            events_processed: self.events_processed.snapshot(),
            trades_total: self.trades_total.snapshot(),
            buffer_overflows_total: self.buffer_overflows_total.snapshot(),
            opportunities_detected_total: self.opportunities_detected_total.snapshot(),
            stop_loss_triggered_total: self.stop_loss_triggered_total.snapshot(),
            liquidations_detected_total: self.liquidations_detected_total.snapshot(),
            active_arbitrages: self.active_arbitrages(),
            tick_to_order_latency: dump(&self.tick_to_order_latency),
            price_update_latency: dump(&self.price_update_latency),
            order_execution_latency: dump(&self.order_execution_latency),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub events_processed: HashMap<String, u64>,
    pub trades_total: HashMap<String, u64>,
    pub buffer_overflows_total: HashMap<String, u64>,
    pub opportunities_detected_total: HashMap<String, u64>,
    pub stop_loss_triggered_total: HashMap<String, u64>,
    pub liquidations_detected_total: HashMap<String, u64>,
    pub active_arbitrages: i64,
    pub tick_to_order_latency: Vec<HistogramSummary>,
    pub price_update_latency: Vec<HistogramSummary>,
    pub order_execution_latency: Vec<HistogramSummary>,
}
