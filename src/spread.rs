//! Spread evaluator (spec.md §4.2).
//!
//! Reads `BestRecord`s out of the quote aggregator and turns them into a
//! ranked `Opportunity`: short the venue with the higher bid, long the venue
//! with the lower ask, net of both legs' taker fees. Mirrors the
//! evaluate-then-rank shape of `other_examples`'s `ArbEvaluator` (scan pairs
//! of venues, compute a net edge, keep the best) generalized to use the
//! sharded aggregator and a real fee table instead of a flat constant.

use serde::{Deserialize, Serialize};

use crate::config::FeeTable;
use crate::quotes::{BestRecord, QuoteAggregator};

/// A single cross-venue opportunity for one symbol at one instant. Pool
/// carrier — see `pool::Clearable` impl.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    /// Venue to buy (open long) on — has the lower ask.
    pub long_venue: String,
    /// Venue to sell (open short) on — has the higher bid.
    pub short_venue: String,
    pub long_price: f64,
    pub short_price: f64,
    /// Raw percentage spread before fees: (short_price - long_price) / long_price * 100.
    pub raw_spread: f64,
    /// Spread after subtracting both legs' taker fees, in percentage points.
    pub net_spread: f64,
    pub source_timestamp_ms: i64,
}

impl Opportunity {
    fn from_best(best: &BestRecord, long_fee: f64, short_fee: f64) -> Option<Self> {
        if best.best_ask_venue.is_empty() || best.best_bid_venue.is_empty() {
            return None;
        }
        // Same venue can't be both legs: spec.md §4.2 requires a genuine
        // cross-venue spread.
        if best.best_ask_venue == best.best_bid_venue {
            return None;
        }
        let raw_spread = (best.best_bid - best.best_ask) / best.best_ask * 100.0;
        // Four taker fills: open long, open short, close long, close short.
        let net_spread = raw_spread - 2.0 * (long_fee + short_fee) * 100.0;
        Some(Self {
            symbol: best.symbol.clone(),
            long_venue: best.best_ask_venue.clone(),
            short_venue: best.best_bid_venue.clone(),
            long_price: best.best_ask,
            short_price: best.best_bid,
            raw_spread,
            net_spread,
            source_timestamp_ms: best.best_ask_ts.max(best.best_bid_ts),
        })
    }
}

/// Stateless evaluator over a `QuoteAggregator` and a `FeeTable`; holds no
/// data of its own, mirroring `ArbEvaluator`'s role as a pure function over
/// externally owned state.
pub struct SpreadEvaluator<'a> {
    aggregator: &'a QuoteAggregator,
    fees: &'a FeeTable,
    default_taker_fee: f64,
}

impl<'a> SpreadEvaluator<'a> {
    pub fn new(aggregator: &'a QuoteAggregator, fees: &'a FeeTable, default_taker_fee: f64) -> Self {
        Self {
            aggregator,
            fees,
            default_taker_fee,
        }
    }

    /// The single best opportunity currently known for a symbol, net of
    /// fees, or `None` if the symbol has no complete best-record yet or the
    /// only venue quoting it is the same on both sides.
    pub fn best_opportunity(&self, symbol: &str) -> Option<Opportunity> {
        let best = self.aggregator.best(symbol)?;
        let long_fee = self.fees.get(&best.best_ask_venue, symbol, self.default_taker_fee);
        let short_fee = self.fees.get(&best.best_bid_venue, symbol, self.default_taker_fee);
        Opportunity::from_best(&best, long_fee, short_fee)
    }

    /// Live close-side prices for an open pair: selling the long leg fills at
    /// `long_venue`'s bid, covering the short leg fills at `short_venue`'s
    /// ask. `None` if either venue has no usable quote yet.
    pub fn live_close_prices(&self, symbol: &str, long_venue: &str, short_venue: &str) -> Option<(f64, f64)> {
        let long_quote = self.aggregator.quote(long_venue, symbol)?;
        let short_quote = self.aggregator.quote(short_venue, symbol)?;
        if long_quote.bid_price <= 0.0 || short_quote.ask_price <= 0.0 {
            return None;
        }
        Some((long_quote.bid_price, short_quote.ask_price))
    }

    /// Current raw/net close-side spread for a Holding pair (spec.md §4.2):
    /// `(bid_long − ask_short)/ask_short × 100`. Returns `(0, 0)` if either
    /// venue has no quote yet.
    pub fn current_spread(&self, symbol: &str, long_venue: &str, short_venue: &str) -> (f64, f64) {
        let Some((bid_long, ask_short)) = self.live_close_prices(symbol, long_venue, short_venue) else {
            return (0.0, 0.0);
        };
        let raw = (bid_long - ask_short) / ask_short * 100.0;
        let long_fee = self.fees.get(long_venue, symbol, self.default_taker_fee);
        let short_fee = self.fees.get(short_venue, symbol, self.default_taker_fee);
        let net = raw - (long_fee + short_fee) * 100.0;
        (raw, net)
    }

    /// Dollar unrealized PnL for an open pair against fresh quotes (spec.md
    /// §4.2): `(bid_long − long_entry)·qty + (short_entry − ask_short)·qty`.
    /// Returns 0 if either venue has no quote yet.
    pub fn pnl(
        &self,
        symbol: &str,
        long_venue: &str,
        short_venue: &str,
        long_entry: f64,
        short_entry: f64,
        qty: f64,
    ) -> f64 {
        match self.live_close_prices(symbol, long_venue, short_venue) {
            Some((bid_long, ask_short)) => (bid_long - long_entry) * qty + (short_entry - ask_short) * qty,
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::sync::Arc;

    fn setup() -> (QuoteAggregator, FeeTable) {
        let agg = QuoteAggregator::new(2, 1, 1000, Arc::new(Metrics::new()));
        let fees = FeeTable::new();
        (agg, fees)
    }

    #[test]
    fn best_opportunity_picks_lower_ask_and_higher_bid() {
        let (agg, fees) = setup();
        agg.apply_update("binance", "BTCUSDT", 49990.0, 50000.0, 1);
        agg.apply_update("okx", "BTCUSDT", 50100.0, 50120.0, 2);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let eval = SpreadEvaluator::new(&agg, &fees, 0.0005);
        let opp = eval.best_opportunity("BTCUSDT").expect("opportunity present");
        assert_eq!(opp.long_venue, "binance");
        assert_eq!(opp.short_venue, "okx");
        assert!(opp.raw_spread > 0.0);
        assert!(opp.net_spread < opp.raw_spread);
    }

    #[test]
    fn best_opportunity_pins_scenario_one_net_spread() {
        // spec.md scenario 1: binance taker fee 0.04%, okx taker fee 0.05%.
        // raw = (50100-50000)/50000*100 = 0.2; four taker fills subtract
        // 2*(0.0004+0.0005)*100 = 0.18, leaving net = 0.02.
        let (agg, mut fees) = setup();
        fees.set("binance", "BTCUSDT", 0.0004);
        fees.set("okx", "BTCUSDT", 0.0005);
        agg.apply_update("binance", "BTCUSDT", 49990.0, 50000.0, 1);
        agg.apply_update("okx", "BTCUSDT", 50100.0, 50120.0, 2);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let eval = SpreadEvaluator::new(&agg, &fees, 0.0005);
        let opp = eval.best_opportunity("BTCUSDT").expect("opportunity present");
        assert!((opp.raw_spread - 0.2).abs() < 1e-9);
        assert!((opp.net_spread - 0.02).abs() < 1e-9);
    }

    #[test]
    fn same_venue_both_sides_yields_no_opportunity() {
        let (agg, fees) = setup();
        agg.apply_update("binance", "ETHUSDT", 3000.0, 3010.0, 1);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let eval = SpreadEvaluator::new(&agg, &fees, 0.0005);
        assert!(eval.best_opportunity("ETHUSDT").is_none());
    }

    #[test]
    fn pnl_is_dollar_denominated_and_fee_free() {
        // long@34 on binance, short@36 on okx, qty=10; live bid=30/ask=38 ->
        // (30-34)*10 + (36-38)*10 = -60. Matches spec.md's stop-loss scenario.
        let (agg, fees) = setup();
        agg.apply_update("binance", "BTCUSDT", 30.0, 30.5, 1);
        agg.apply_update("okx", "BTCUSDT", 37.5, 38.0, 2);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let eval = SpreadEvaluator::new(&agg, &fees, 0.0005);
        let pnl = eval.pnl("BTCUSDT", "binance", "okx", 34.0, 36.0, 10.0);
        assert!((pnl - (-60.0)).abs() < 1e-6);
    }

    #[test]
    fn pnl_is_zero_when_quotes_are_missing() {
        let (agg, fees) = setup();
        let eval = SpreadEvaluator::new(&agg, &fees, 0.0005);
        assert_eq!(eval.pnl("NOPEUSDT", "binance", "okx", 34.0, 36.0, 10.0), 0.0);
    }

    #[test]
    fn current_spread_uses_close_side_prices() {
        // To close: sell the long leg at long_venue's bid, buy back the
        // short leg at short_venue's ask.
        let (agg, fees) = setup();
        agg.apply_update("binance", "BTCUSDT", 50000.0, 50001.0, 1);
        agg.apply_update("okx", "BTCUSDT", 50099.0, 50100.0, 2);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let eval = SpreadEvaluator::new(&agg, &fees, 0.0);
        let (raw, net) = eval.current_spread("BTCUSDT", "binance", "okx");
        let expected = (50000.0 - 50100.0) / 50100.0 * 100.0;
        assert!((raw - expected).abs() < 1e-9);
        assert_eq!(raw, net); // zero fees in this setup
    }

    #[test]
    fn missing_symbol_has_no_opportunity() {
        let (agg, fees) = setup();
        let eval = SpreadEvaluator::new(&agg, &fees, 0.0005);
        assert!(eval.best_opportunity("NOPEUSDT").is_none());
    }
}
