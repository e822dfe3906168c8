//! Book liquidity analyzer (spec.md §4.3).
//!
//! Keeps a shallow order book snapshot per `(symbol, venue)` and answers
//! "can I actually get `qty` filled near the touch" by walking levels,
//! grounded in `other_examples`'s `OrderBook::vwap_fill_ask` (accumulate
//! volume low-to-high until the target is reached, track the
//! volume-weighted average price).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One price/volume level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub volume: f64,
}

/// Shallow snapshot of one venue's book for one symbol: bids descending,
/// asks ascending, truncated to `book_depth`.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub symbol: String,
    pub venue: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    ingest_time: Instant,
}

impl BookSnapshot {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.ingest_time.elapsed() > ttl
    }
}

/// Result of walking the book to fill `qty`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FillSimulation {
    pub avg_price: f64,
    pub filled_volume: f64,
    pub slippage_pct: f64,
    pub fully_fillable: bool,
    pub levels_used: usize,
}

/// Outcome of `analyze`: whether both legs can be filled near quoted prices,
/// the slippage-adjusted net spread, estimated profit, and any warnings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityAnalysis {
    pub is_liquidity_ok: bool,
    pub adjusted_net_spread: f64,
    pub estimated_profit: f64,
    pub warnings: Vec<String>,
}

/// Caps applied by `analyze` when deciding whether a leg's slippage is
/// acceptable.
#[derive(Debug, Clone, Copy)]
pub struct LiquidityThresholds {
    pub max_slippage_pct: f64,
    pub book_ttl: Duration,
}

impl Default for LiquidityThresholds {
    fn default() -> Self {
        Self {
            max_slippage_pct: 0.1,
            book_ttl: Duration::from_secs(5),
        }
    }
}

pub struct BookLiquidityAnalyzer {
    books: RwLock<HashMap<(String, String), BookSnapshot>>,
    book_depth: usize,
    thresholds: LiquidityThresholds,
}

impl BookLiquidityAnalyzer {
    pub fn new(book_depth: usize, thresholds: LiquidityThresholds) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            book_depth,
            thresholds,
        }
    }

    pub fn update(&self, symbol: &str, venue: &str, mut bids: Vec<Level>, mut asks: Vec<Level>) {
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        bids.truncate(self.book_depth);
        asks.truncate(self.book_depth);
        self.books.write().insert(
            (symbol.to_string(), venue.to_string()),
            BookSnapshot {
                symbol: symbol.to_string(),
                venue: venue.to_string(),
                bids,
                asks,
                ingest_time: Instant::now(),
            },
        );
    }

    fn snapshot(&self, symbol: &str, venue: &str) -> Option<BookSnapshot> {
        let books = self.books.read();
        let snap = books.get(&(symbol.to_string(), venue.to_string()))?;
        if snap.is_stale(self.thresholds.book_ttl) {
            return None;
        }
        Some(snap.clone())
    }

    /// Walk ask levels low-to-high to fill a buy of `qty`.
    pub fn simulate_buy(&self, symbol: &str, venue: &str, qty: f64) -> Option<FillSimulation> {
        let snap = self.snapshot(symbol, venue)?;
        let best_ask = snap.asks.first()?.price;
        Some(walk_levels(&snap.asks, qty, best_ask, true))
    }

    /// Walk bid levels high-to-low to fill a sell of `qty`.
    pub fn simulate_sell(&self, symbol: &str, venue: &str, qty: f64) -> Option<FillSimulation> {
        let snap = self.snapshot(symbol, venue)?;
        let best_bid = snap.bids.first()?.price;
        Some(walk_levels(&snap.bids, qty, best_bid, false))
    }

    /// Combine both legs' fill simulations into a liquidity verdict.
    pub fn analyze(
        &self,
        symbol: &str,
        qty: f64,
        long_venue: &str,
        short_venue: &str,
    ) -> LiquidityAnalysis {
        let mut warnings = Vec::new();

        let long_fill = self.simulate_buy(symbol, long_venue, qty);
        let short_fill = self.simulate_sell(symbol, short_venue, qty);

        let (long_fill, short_fill) = match (long_fill, short_fill) {
            (Some(l), Some(s)) => (l, s),
            _ => {
                warnings.push(format!("no book snapshot available for {symbol}"));
                return LiquidityAnalysis {
                    is_liquidity_ok: false,
                    adjusted_net_spread: 0.0,
                    estimated_profit: 0.0,
                    warnings,
                };
            }
        };

        if !long_fill.fully_fillable {
            warnings.push(format!("{long_venue} long leg not fully fillable for qty {qty}"));
        }
        if !short_fill.fully_fillable {
            warnings.push(format!("{short_venue} short leg not fully fillable for qty {qty}"));
        }
        if long_fill.slippage_pct > self.thresholds.max_slippage_pct {
            warnings.push(format!(
                "{long_venue} long leg slippage {:.4}% exceeds cap",
                long_fill.slippage_pct
            ));
        }
        if short_fill.slippage_pct > self.thresholds.max_slippage_pct {
            warnings.push(format!(
                "{short_venue} short leg slippage {:.4}% exceeds cap",
                short_fill.slippage_pct
            ));
        }

        let adjusted_net_spread =
            (short_fill.avg_price - long_fill.avg_price) / long_fill.avg_price * 100.0;
        let estimated_profit = (short_fill.avg_price - long_fill.avg_price) * qty;
        let is_liquidity_ok = long_fill.fully_fillable
            && short_fill.fully_fillable
            && long_fill.slippage_pct <= self.thresholds.max_slippage_pct
            && short_fill.slippage_pct <= self.thresholds.max_slippage_pct;

        LiquidityAnalysis {
            is_liquidity_ok,
            adjusted_net_spread,
            estimated_profit,
            warnings,
        }
    }
}

fn walk_levels(levels: &[Level], qty: f64, touch_price: f64, is_ask: bool) -> FillSimulation {
    let mut filled_volume = 0.0;
    let mut notional = 0.0;
    let mut levels_used = 0;

    for level in levels {
        if filled_volume >= qty {
            break;
        }
        let take = (qty - filled_volume).min(level.volume);
        filled_volume += take;
        notional += take * level.price;
        levels_used += 1;
    }

    let avg_price = if filled_volume > 0.0 {
        notional / filled_volume
    } else {
        touch_price
    };
    let slippage_pct = if is_ask {
        (avg_price - touch_price) / touch_price * 100.0
    } else {
        (touch_price - avg_price) / touch_price * 100.0
    };

    FillSimulation {
        avg_price,
        filled_volume,
        slippage_pct,
        fully_fillable: filled_volume >= qty,
        levels_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> BookLiquidityAnalyzer {
        BookLiquidityAnalyzer::new(5, LiquidityThresholds::default())
    }

    #[test]
    fn simulate_buy_walks_ask_levels_to_fill_qty() {
        let a = analyzer();
        a.update(
            "BTCUSDT",
            "binance",
            vec![Level { price: 49990.0, volume: 10.0 }],
            vec![
                Level { price: 50000.0, volume: 1.0 },
                Level { price: 50010.0, volume: 1.0 },
            ],
        );
        let sim = a.simulate_buy("BTCUSDT", "binance", 1.5).unwrap();
        assert!(sim.fully_fillable);
        assert_eq!(sim.levels_used, 2);
        assert!(sim.avg_price > 50000.0 && sim.avg_price < 50010.0);
        assert!(sim.slippage_pct > 0.0);
    }

    #[test]
    fn insufficient_depth_is_not_fully_fillable() {
        let a = analyzer();
        a.update(
            "BTCUSDT",
            "binance",
            vec![Level { price: 49990.0, volume: 0.5 }],
            vec![Level { price: 50000.0, volume: 0.5 }],
        );
        let sim = a.simulate_sell("BTCUSDT", "binance", 2.0).unwrap();
        assert!(!sim.fully_fillable);
        assert_eq!(sim.filled_volume, 0.5);
    }

    #[test]
    fn missing_snapshot_yields_not_ok_analysis() {
        let a = analyzer();
        let result = a.analyze("ETHUSDT", 1.0, "binance", "okx");
        assert!(!result.is_liquidity_ok);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn analyze_combines_both_legs() {
        let a = analyzer();
        a.update(
            "BTCUSDT",
            "binance",
            vec![Level { price: 49990.0, volume: 10.0 }],
            vec![Level { price: 50000.0, volume: 10.0 }],
        );
        a.update(
            "BTCUSDT",
            "okx",
            vec![Level { price: 50100.0, volume: 10.0 }],
            vec![Level { price: 50120.0, volume: 10.0 }],
        );
        let result = a.analyze("BTCUSDT", 1.0, "binance", "okx");
        assert!(result.is_liquidity_ok);
        assert!(result.estimated_profit > 0.0);
    }
}
