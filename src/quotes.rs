//! Quote aggregator (spec.md §4.1).
//!
//! Sharded by symbol so that a given symbol is always handled by the same
//! shard (preserving per-symbol order) while unrelated symbols never
//! contend on the same mutex. Each shard is a single `parking_lot::Mutex`
//! guarding a small map plus a bounded `crossbeam::channel` intake drained
//! by `workers_per_shard` plain threads — the "plain threads + channels"
//! model spec.md §9 calls out for CPU-ish hot-path work, grounded in the
//! edge-receiver/engine-client split in `edge::receiver` (bounded channel,
//! worker loop, stats counters on drop).

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;
use crate::pool::Pool;

/// Immutable snapshot of one venue's top-of-book for one symbol. Pool
/// carrier — see `pool::Clearable` impl.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quote {
    pub venue: String,
    pub symbol: String,
    pub bid_price: f64,
    pub ask_price: f64,
    pub timestamp_ms: i64,
}

impl Quote {
    pub fn new(venue: &str, symbol: &str, bid_price: f64, ask_price: f64, timestamp_ms: i64) -> Self {
        Self {
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            bid_price,
            ask_price,
            timestamp_ms,
        }
    }

    /// spec.md §4.1: "A quote with bid<=0 or ask<=0 is stored but is
    /// skipped by best-record selection."
    fn usable(&self) -> bool {
        self.bid_price > 0.0 && self.ask_price > 0.0
    }
}

/// Best bid/ask across venues for one symbol, recomputed on every update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BestRecord {
    pub symbol: String,
    pub best_ask: f64,
    pub best_ask_venue: String,
    pub best_ask_ts: i64,
    pub best_bid: f64,
    pub best_bid_venue: String,
    pub best_bid_ts: i64,
    pub raw_spread: f64,
}

impl BestRecord {
    fn is_complete(&self) -> bool {
        !self.best_ask_venue.is_empty() && !self.best_bid_venue.is_empty()
    }
}

/// Allocation-free FNV-1a 32-bit hash over a symbol string, used to pick a
/// shard deterministically (spec.md §4.1).
#[inline]
fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

struct ShardState {
    /// (venue, symbol) -> latest quote.
    quotes: HashMap<(String, String), Quote>,
    /// symbol -> venue keys seen, for the O(k) best-record rescan.
    venues_by_symbol: HashMap<String, Vec<String>>,
    /// symbol -> current best record.
    best: HashMap<String, BestRecord>,
}

impl ShardState {
    fn new() -> Self {
        Self {
            quotes: HashMap::new(),
            venues_by_symbol: HashMap::new(),
            best: HashMap::new(),
        }
    }

    /// Insert-or-replace the per-venue quote, then recompute the symbol's
    /// best record by an O(k) scan over its (small) venue list.
    fn apply(&mut self, update: Quote) {
        let key = (update.venue.clone(), update.symbol.clone());
        let is_new_venue = !self.quotes.contains_key(&key);
        if is_new_venue {
            self.venues_by_symbol
                .entry(update.symbol.clone())
                .or_default()
                .push(update.venue.clone());
        }
        let symbol = update.symbol.clone();
        self.quotes.insert(key, update);

        let venues = match self.venues_by_symbol.get(&symbol) {
            Some(v) => v,
            None => return,
        };

        let mut best = BestRecord {
            symbol: symbol.clone(),
            best_ask: f64::INFINITY,
            best_bid: f64::NEG_INFINITY,
            ..Default::default()
        };
        for venue in venues {
            let Some(q) = self.quotes.get(&(venue.clone(), symbol.clone())) else {
                continue;
            };
            if !q.usable() {
                continue;
            }
            if q.ask_price < best.best_ask {
                best.best_ask = q.ask_price;
                best.best_ask_venue = venue.clone();
                best.best_ask_ts = q.timestamp_ms;
            }
            if q.bid_price > best.best_bid {
                best.best_bid = q.bid_price;
                best.best_bid_venue = venue.clone();
                best.best_bid_ts = q.timestamp_ms;
            }
        }

        if best.is_complete() {
            best.raw_spread = (best.best_bid - best.best_ask) / best.best_ask * 100.0;
            self.best.insert(symbol, best);
        } else {
            self.best.remove(&symbol);
        }
    }

    fn best(&self, symbol: &str) -> Option<BestRecord> {
        self.best.get(symbol).cloned()
    }

    fn quote(&self, venue: &str, symbol: &str) -> Option<Quote> {
        self.quotes
            .get(&(venue.to_string(), symbol.to_string()))
            .cloned()
    }
}

struct Shard {
    state: Mutex<ShardState>,
    tx: Sender<Quote>,
}

/// Sharded top-of-book aggregator. `N` shards (default
/// `min(max(cpu_count,4),32)` via `EngineConfig`); one symbol always maps to
/// the same shard so per-symbol update order is FIFO on that shard's
/// channel even though `workers_per_shard` threads drain it concurrently.
pub struct QuoteAggregator {
    shards: Vec<Arc<Shard>>,
    pool: Arc<Pool<Quote>>,
    metrics: Arc<Metrics>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl QuoteAggregator {
    pub fn new(
        num_shards: usize,
        workers_per_shard: usize,
        channel_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let pool = Arc::new(Pool::<Quote>::new(channel_capacity * num_shards.max(1)));
        let mut shards = Vec::with_capacity(num_shards.max(1));
        let mut workers = Vec::new();

        for shard_idx in 0..num_shards.max(1) {
            let (tx, rx): (Sender<Quote>, Receiver<Quote>) = bounded(channel_capacity.max(1));
            let shard = Arc::new(Shard {
                state: Mutex::new(ShardState::new()),
                tx,
            });
            shards.push(shard.clone());

            for worker_idx in 0..workers_per_shard.max(1) {
                let shard = shard.clone();
                let pool = pool.clone();
                let metrics = metrics.clone();
                let rx = rx.clone();
                let handle = thread::Builder::new()
                    .name(format!("quote-shard-{shard_idx}-w{worker_idx}"))
                    .spawn(move || {
                        for update in rx.iter() {
                            shard.state.lock().apply(update.clone());
                            metrics.events_processed.incr("type=quote");
                            pool.release(update);
                        }
                    })
                    .expect("failed to spawn quote shard worker");
                workers.push(handle);
            }
        }

        Self {
            shards,
            pool,
            metrics,
            _workers: workers,
        }
    }

    fn shard_for(&self, symbol: &str) -> &Arc<Shard> {
        let idx = fnv1a_32(symbol.as_bytes()) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Acquire a pooled carrier for a producer to fill in before calling
    /// `submit`.
    pub fn acquire_carrier(&self) -> Quote {
        self.pool.acquire()
    }

    /// Enqueue a quote update. Returns `true` if accepted, `false` if the
    /// shard's intake channel was full — in which case the update is
    /// dropped and the carrier is returned to the pool immediately (spec.md
    /// §4.1/§5: prefer losing a stale quote to blocking the producer).
    pub fn submit(&self, update: Quote) -> bool {
        let shard = self.shard_for(&update.symbol);
        match shard.tx.try_send(update) {
            Ok(()) => true,
            Err(TrySendError::Full(update)) => {
                self.metrics
                    .buffer_overflows_total
                    .incr("buffer=price_shard");
                self.pool.release(update);
                false
            }
            Err(TrySendError::Disconnected(update)) => {
                self.pool.release(update);
                false
            }
        }
    }

    /// Convenience: acquire, fill, and submit in one call.
    pub fn apply_update(
        &self,
        venue: &str,
        symbol: &str,
        bid_price: f64,
        ask_price: f64,
        timestamp_ms: i64,
    ) -> bool {
        let mut carrier = self.acquire_carrier();
        carrier.venue = venue.to_string();
        carrier.symbol = symbol.to_string();
        carrier.bid_price = bid_price;
        carrier.ask_price = ask_price;
        carrier.timestamp_ms = timestamp_ms;
        self.submit(carrier)
    }

    /// Read-only poll of the current best record for a symbol. Never
    /// blocks on writers for long — only the O(k) recompute inside the
    /// shard mutex.
    pub fn best(&self, symbol: &str) -> Option<BestRecord> {
        self.shard_for(symbol).state.lock().best(symbol)
    }

    pub fn quote(&self, venue: &str, symbol: &str) -> Option<Quote> {
        self.shard_for(symbol).state.lock().quote(venue, symbol)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Blocks until every shard's intake channel has drained. Test-only:
    /// production readers never need to wait since `best()` always reflects
    /// whatever has been applied so far.
    #[cfg(test)]
    fn drain(&self) {
        loop {
            if self.shards.iter().all(|s| s.tx.is_empty()) {
                // One more pass to allow in-flight `apply` calls to finish.
                std::thread::sleep(std::time::Duration::from_millis(5));
                if self.shards.iter().all(|s| s.tx.is_empty()) {
                    break;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_aggregator() -> QuoteAggregator {
        QuoteAggregator::new(4, 2, 2000, Arc::new(Metrics::new()))
    }

    #[test]
    fn symbol_hashes_to_same_shard_deterministically() {
        let agg = test_aggregator();
        let idx1 = fnv1a_32("BTCUSDT".as_bytes()) as usize % agg.num_shards();
        let idx2 = fnv1a_32("BTCUSDT".as_bytes()) as usize % agg.num_shards();
        assert_eq!(idx1, idx2);
    }

    #[test]
    fn best_record_tracks_min_ask_and_max_bid() {
        let agg = test_aggregator();
        agg.apply_update("binance", "BTCUSDT", 49990.0, 50000.0, 1);
        agg.apply_update("okx", "BTCUSDT", 50100.0, 50120.0, 2);
        agg.drain();

        let best = agg.best("BTCUSDT").expect("best record present");
        assert_eq!(best.best_ask_venue, "binance");
        assert_eq!(best.best_ask, 50000.0);
        assert_eq!(best.best_bid_venue, "okx");
        assert_eq!(best.best_bid, 50100.0);
        assert!((best.raw_spread - 0.2).abs() < 1e-9);
    }

    #[test]
    fn invalid_quote_is_stored_but_excluded_from_best() {
        let agg = test_aggregator();
        agg.apply_update("binance", "ETHUSDT", 3000.0, 3010.0, 1);
        agg.apply_update("okx", "ETHUSDT", 0.0, -1.0, 2);
        agg.drain();

        let best = agg.best("ETHUSDT").unwrap();
        assert_eq!(best.best_ask_venue, "binance");
        assert_eq!(best.best_bid_venue, "binance");

        let stored = agg.quote("okx", "ETHUSDT").unwrap();
        assert_eq!(stored.bid_price, 0.0);
    }

    #[test]
    fn applying_same_quote_twice_is_idempotent() {
        let agg = test_aggregator();
        agg.apply_update("binance", "SOLUSDT", 100.0, 100.5, 1);
        agg.drain();
        let first = agg.best("SOLUSDT").unwrap();
        agg.apply_update("binance", "SOLUSDT", 100.0, 100.5, 1);
        agg.drain();
        let second = agg.best("SOLUSDT").unwrap();
        assert_eq!(first.best_ask, second.best_ask);
        assert_eq!(first.best_bid, second.best_bid);
        assert_eq!(first.raw_spread, second.raw_spread);
    }

    #[test]
    fn out_of_order_timestamp_replaces_by_latest_without_rejection() {
        let agg = test_aggregator();
        agg.apply_update("binance", "XRPUSDT", 1.0, 1.01, 100);
        agg.apply_update("binance", "XRPUSDT", 2.0, 2.01, 50); // older ts, accepted anyway
        agg.drain();
        let q = agg.quote("binance", "XRPUSDT").unwrap();
        assert_eq!(q.bid_price, 2.0);
        assert_eq!(q.timestamp_ms, 50);
    }

    #[test]
    fn missing_symbol_returns_none() {
        let agg = test_aggregator();
        assert!(agg.best("NOPEUSDT").is_none());
    }
}
