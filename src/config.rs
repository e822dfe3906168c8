//! Configuration surface (spec.md §6), loaded the way `vault`'s strategy
//! configs do in the teacher crate: a `Default` impl with every field
//! documented inline, then `from_env()` overriding fields one at a time
//! after validating the parsed value, never panicking on a bad var.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of quote-aggregator shards. Default: `available_parallelism`
    /// clamped to [4, 32].
    pub num_shards: usize,
    /// Worker threads draining each shard's intake channel.
    pub workers_per_shard: usize,
    /// Bounded capacity of each shard's intake channel.
    pub shard_channel_capacity: usize,
    /// Bounded capacity of the notification channel.
    pub notification_channel_capacity: usize,
    /// Deadline for a single venue order call.
    pub order_timeout: Duration,
    /// How often cached balances are considered fresh.
    pub balance_refresh_interval: Duration,
    /// How often periodic stats snapshots are taken.
    pub stats_refresh_interval: Duration,
    /// Initial/max backoff for venue reconnects.
    pub ws_reconnect_initial: Duration,
    pub ws_reconnect_max: Duration,
    /// 0 = unlimited concurrent arbitrages across all pairs.
    pub max_concurrent_arbs: usize,
    /// Transient-error retry budget and backoff for non-emergency paths.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Safety multiplier applied to required margin before admission.
    pub margin_safety_buffer: f64,
    /// Fallback taker fee when a venue's fee table doesn't have an entry.
    pub default_taker_fee: f64,
    /// Order book levels retained per (symbol, venue).
    pub book_depth: usize,
    /// Book snapshot freshness TTL.
    pub book_ttl: Duration,
    /// Softening factor applied to the entry threshold when re-checking
    /// spread between partial-entry sub-orders (spec.md §4.7).
    pub exit_spread_softening: f64,
    /// Risk monitor tick interval.
    pub risk_tick_interval: Duration,
    /// Slippage above which the entry evaluator warns (spec.md §4.6).
    pub slippage_warn_threshold_pct: f64,
    /// Timeout for the second-leg rollback's independent deadline.
    pub rollback_timeout: Duration,
    /// Retry budget for ordinary rollback (non-liquidation).
    pub rollback_max_retries: u32,
    /// Retry budget for the aggressive liquidation/emergency close path.
    pub emergency_max_retries: u32,
    pub emergency_retry_backoff: Duration,
    /// Timeout used when fetching a balance on cache miss (spec.md §4.6).
    pub balance_fetch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            num_shards: cpus.max(4).min(32),
            workers_per_shard: 2,
            shard_channel_capacity: 2000,
            notification_channel_capacity: 100,
            order_timeout: Duration::from_secs(5),
            balance_refresh_interval: Duration::from_secs(10),
            stats_refresh_interval: Duration::from_secs(5),
            ws_reconnect_initial: Duration::from_secs(2),
            ws_reconnect_max: Duration::from_secs(16),
            max_concurrent_arbs: 0,
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
            margin_safety_buffer: 1.5,
            default_taker_fee: 0.0005,
            book_depth: 5,
            book_ttl: Duration::from_secs(5),
            exit_spread_softening: 0.8,
            risk_tick_interval: Duration::from_millis(500),
            slippage_warn_threshold_pct: 0.05,
            rollback_timeout: Duration::from_secs(30),
            rollback_max_retries: 1,
            emergency_max_retries: 6,
            emergency_retry_backoff: Duration::from_millis(200),
            balance_fetch_timeout: Duration::from_millis(200),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then override from `ARB_*` environment variables. A
    /// var that is present but fails to parse or fails validation is
    /// ignored in favor of the default — never panics.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("ARB_NUM_SHARDS") {
            if let Ok(n) = v.parse::<usize>() {
                if (1..=256).contains(&n) {
                    cfg.num_shards = n;
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_WORKERS_PER_SHARD") {
            if let Ok(n) = v.parse::<usize>() {
                if n >= 1 {
                    cfg.workers_per_shard = n;
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_SHARD_CHANNEL_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                if n >= 1 {
                    cfg.shard_channel_capacity = n;
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_ORDER_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                if ms > 0 {
                    cfg.order_timeout = Duration::from_millis(ms);
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_MAX_CONCURRENT_ARBS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_concurrent_arbs = n;
            }
        }
        if let Ok(v) = std::env::var("ARB_MAX_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("ARB_MARGIN_SAFETY_BUFFER") {
            if let Ok(x) = v.parse::<f64>() {
                if x.is_finite() && x >= 1.0 {
                    cfg.margin_safety_buffer = x;
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_DEFAULT_TAKER_FEE") {
            if let Ok(x) = v.parse::<f64>() {
                if x.is_finite() && x >= 0.0 {
                    cfg.default_taker_fee = x;
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_BOOK_DEPTH") {
            if let Ok(n) = v.parse::<usize>() {
                if n >= 1 {
                    cfg.book_depth = n;
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_BOOK_TTL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                if ms > 0 {
                    cfg.book_ttl = Duration::from_millis(ms);
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_EXIT_SPREAD_SOFTENING") {
            if let Ok(x) = v.parse::<f64>() {
                if x.is_finite() && x > 0.0 && x <= 1.0 {
                    cfg.exit_spread_softening = x;
                }
            }
        }
        if let Ok(v) = std::env::var("ARB_RISK_TICK_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                if ms > 0 {
                    cfg.risk_tick_interval = Duration::from_millis(ms);
                }
            }
        }

        cfg
    }
}

/// Per-(venue, symbol) taker fee table, with a default fallback (spec.md
/// §4.2: "default taker fee 0.05% when absent").
#[derive(Debug, Clone, Default)]
pub struct FeeTable {
    fees: std::collections::HashMap<(String, String), f64>,
}

impl FeeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, venue: &str, symbol: &str, fee: f64) {
        self.fees
            .insert((venue.to_string(), symbol.to_string()), fee);
    }

    pub fn get(&self, venue: &str, symbol: &str, default_fee: f64) -> f64 {
        self.fees
            .get(&(venue.to_string(), symbol.to_string()))
            .copied()
            .unwrap_or(default_fee)
    }
}
