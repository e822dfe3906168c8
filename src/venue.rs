//! Venue adapter contract (spec.md §6).
//!
//! Concrete venues are external collaborators reached only through this
//! trait — credential storage, REST/streaming plumbing, and reconnect logic
//! live on the adapter side, not here. `PaperVenueAdapter` is a deterministic
//! in-process stand-in for tests, grounded in `vault::execution`'s
//! `PaperExecutionAdapter` in the teacher crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VenueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn reverse(self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The order side that opens this position side (taker market order).
    pub fn open_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// The order side that closes this position side.
    pub fn close_side(self) -> OrderSide {
        self.open_side().reverse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    Rejected,
}

/// Result of placing a taker market order, as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub status: OrderStatus,
}

/// Venue-reported trading limits for a symbol (feeds `validator`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradingLimits {
    pub min_qty: f64,
    pub max_qty: f64,
    pub qty_step: f64,
    pub min_notional: f64,
    pub price_tick: f64,
    pub max_leverage: f64,
}

/// An open position as reported by a venue (used by the out-of-scope
/// recovery routine; kept here since it is part of the adapter contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
}

/// A venue-initiated liquidation event delivered via the position-event
/// callback.
#[derive(Debug, Clone)]
pub struct LiquidationEvent {
    pub venue: String,
    pub symbol: String,
    pub side: PositionSide,
    pub liquidated: bool,
}

/// Each supported venue implements this. The core never inspects adapter
/// internals (credentials, connection state) — it only calls through the
/// trait, per spec.md §9's "dynamic dispatch over venues" note.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn taker_fee(&self, symbol: &str) -> Result<f64, VenueError>;

    async fn trading_limits(&self, symbol: &str) -> Result<TradingLimits, VenueError>;

    async fn balance(&self) -> Result<f64, VenueError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
    ) -> Result<OrderRecord, VenueError>;

    async fn close_position(
        &self,
        symbol: &str,
        position_side: PositionSide,
        qty: f64,
    ) -> Result<OrderRecord, VenueError>;

    async fn open_positions(&self) -> Result<Vec<VenuePosition>, VenueError>;
}

/// Jittered exponential backoff, grounded in `edge::client`'s reconnect
/// policy and spec.md §6's `ws_reconnect_initial`/`ws_reconnect_max` knobs.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Next delay, with 0-50% jitter, doubling each call.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.initial.as_millis() as u64 * (1u64 << self.attempt.min(16));
        let capped = exp.min(self.max.as_millis() as u64).max(1);
        self.attempt += 1;
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        Duration::from_millis(capped + jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Deterministic paper-mode adapter for tests and local runs. Mirrors the
/// teacher's `PaperExecutionAdapter`: configurable simulated latency,
/// slippage, partial fills, and random rejection, but with a toggle to make
/// all outcomes deterministic (`jitter = false`) for property tests.
#[derive(Debug, Clone)]
pub struct PaperVenueAdapterConfig {
    pub fee: f64,
    pub limits: TradingLimits,
    pub balance: f64,
    pub reject_prob: f64,
    pub slippage_bps: f64,
    pub simulated_latency: Duration,
    /// When false, `place_market_order`/`close_position` never reject and
    /// never inject slippage — used by deterministic unit tests.
    pub jitter: bool,
}

impl Default for PaperVenueAdapterConfig {
    fn default() -> Self {
        Self {
            fee: 0.0005,
            limits: TradingLimits {
                min_qty: 0.001,
                max_qty: 1_000.0,
                qty_step: 0.001,
                min_notional: 5.0,
                price_tick: 0.01,
                max_leverage: 20.0,
            },
            balance: 100_000.0,
            reject_prob: 0.0,
            slippage_bps: 0.0,
            simulated_latency: Duration::from_millis(0),
            jitter: false,
        }
    }
}

#[derive(Debug)]
pub struct PaperVenueAdapter {
    name: String,
    config: PaperVenueAdapterConfig,
    orders_placed: AtomicU64,
    /// Reference price used to fill market orders when the caller doesn't
    /// carry one through (tests set this directly).
    pub mark_price: parking_lot::RwLock<f64>,
}

impl PaperVenueAdapter {
    pub fn new(name: impl Into<String>, config: PaperVenueAdapterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            orders_placed: AtomicU64::new(0),
            mark_price: parking_lot::RwLock::new(0.0),
        }
    }

    pub fn set_mark_price(&self, price: f64) {
        *self.mark_price.write() = price;
    }

    pub fn orders_placed(&self) -> u64 {
        self.orders_placed.load(Ordering::Relaxed)
    }

    fn fill_price(&self, side: OrderSide) -> f64 {
        let base = *self.mark_price.read();
        if !self.config.jitter || self.config.slippage_bps <= 0.0 {
            return base;
        }
        let mult = self.config.slippage_bps / 10_000.0;
        match side {
            OrderSide::Buy => base * (1.0 + mult),
            OrderSide::Sell => base * (1.0 - mult),
        }
    }
}

#[async_trait]
impl VenueAdapter for PaperVenueAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn taker_fee(&self, _symbol: &str) -> Result<f64, VenueError> {
        Ok(self.config.fee)
    }

    async fn trading_limits(&self, _symbol: &str) -> Result<TradingLimits, VenueError> {
        Ok(self.config.limits)
    }

    async fn balance(&self) -> Result<f64, VenueError> {
        Ok(self.config.balance)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
    ) -> Result<OrderRecord, VenueError> {
        if !self.config.simulated_latency.is_zero() {
            tokio::time::sleep(self.config.simulated_latency).await;
        }
        if self.config.jitter && rand::thread_rng().gen::<f64>() < self.config.reject_prob {
            return Err(VenueError::Transient {
                venue: self.name.clone(),
                message: "simulated rejection".to_string(),
            });
        }
        let price = self.fill_price(side);
        if price <= 0.0 {
            return Err(VenueError::Permanent {
                venue: self.name.clone(),
                message: format!("no mark price set for {symbol}"),
            });
        }
        self.orders_placed.fetch_add(1, Ordering::Relaxed);
        debug!(venue = %self.name, %symbol, ?side, qty, price, "paper order filled");
        Ok(OrderRecord {
            id: format!("paper-{}-{}", self.name, self.orders_placed()),
            filled_qty: qty,
            avg_fill_price: price,
            status: OrderStatus::Filled,
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        position_side: PositionSide,
        qty: f64,
    ) -> Result<OrderRecord, VenueError> {
        self.place_market_order(symbol, position_side.close_side(), qty)
            .await
    }

    async fn open_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_and_sides_roundtrip() {
        assert_eq!(OrderSide::Buy.reverse(), OrderSide::Sell);
        assert_eq!(PositionSide::Long.open_side(), OrderSide::Buy);
        assert_eq!(PositionSide::Long.close_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.open_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.close_side(), OrderSide::Buy);
    }

    #[tokio::test]
    async fn paper_adapter_fills_at_mark_price() {
        let adapter = PaperVenueAdapter::new("binance", PaperVenueAdapterConfig::default());
        adapter.set_mark_price(50_000.0);
        let rec = adapter
            .place_market_order("BTCUSDT", OrderSide::Buy, 0.1)
            .await
            .unwrap();
        assert_eq!(rec.avg_fill_price, 50_000.0);
        assert_eq!(rec.filled_qty, 0.1);
        assert_eq!(rec.status, OrderStatus::Filled);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(800));
        let d0 = b.next_delay();
        let d1 = b.next_delay();
        assert!(d0.as_millis() >= 100 && d0.as_millis() <= 150);
        assert!(d1.as_millis() >= 200 && d1.as_millis() <= 300);
        for _ in 0..10 {
            let d = b.next_delay();
            assert!(d.as_millis() <= 1200);
        }
    }
}
