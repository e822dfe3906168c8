//! Parallel order executor (spec.md §4.7).
//!
//! Places both legs of an entry (or both legs of a close) concurrently via
//! `tokio::join!` over two independently-timed-out futures — never serially
//! — and resolves the four possible outcomes: both filled, one filled (hand
//! off to `rollback::RollbackHandler`), both failed, or the shared deadline
//! expired. `execute_partial_entry` layers the multi-part volume split on
//! top, re-checking the live spread between sub-orders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ExecutionError;
use crate::metrics::Metrics;
use crate::pair::Leg;
use crate::rollback::RollbackHandler;
use crate::venue::{OrderSide, PositionSide, VenueAdapter};

fn leg_pnl(leg: &Leg, close_price: f64) -> f64 {
    match leg.side {
        PositionSide::Long => (close_price - leg.entry_price) * leg.quantity,
        PositionSide::Short => (leg.entry_price - close_price) * leg.quantity,
    }
}

/// Place both legs of a new entry concurrently. On a single-leg failure the
/// filled leg is handed to `rollback` for reversal before this returns.
#[allow(clippy::too_many_arguments)]
pub async fn execute_parallel(
    adapters: &HashMap<String, Arc<dyn VenueAdapter>>,
    pair_id: &str,
    symbol: &str,
    volume: f64,
    long_venue: &str,
    short_venue: &str,
    order_timeout: Duration,
    rollback: &RollbackHandler,
    metrics: &Metrics,
) -> Result<[Leg; 2], ExecutionError> {
    let long_adapter = adapters
        .get(long_venue)
        .cloned()
        .ok_or_else(|| ExecutionError::AdapterMissing(long_venue.to_string()))?;
    let short_adapter = adapters
        .get(short_venue)
        .cloned()
        .ok_or_else(|| ExecutionError::AdapterMissing(short_venue.to_string()))?;

    let symbol_owned = symbol.to_string();
    let long_fut = tokio::time::timeout(
        order_timeout,
        long_adapter.place_market_order(&symbol_owned, OrderSide::Buy, volume),
    );
    let short_fut = tokio::time::timeout(
        order_timeout,
        short_adapter.place_market_order(&symbol_owned, OrderSide::Sell, volume),
    );

    let (long_res, short_res) = tokio::join!(long_fut, short_fut);

    let long_timed_out = long_res.is_err();
    let short_timed_out = short_res.is_err();
    let long_outcome = long_res
        .map_err(|_| "order timed out".to_string())
        .and_then(|inner| inner.map_err(|e| e.to_string()));
    let short_outcome = short_res
        .map_err(|_| "order timed out".to_string())
        .and_then(|inner| inner.map_err(|e| e.to_string()));

    match (long_outcome, short_outcome) {
        (Ok(long_rec), Ok(short_rec)) => {
            metrics.trades_total.incr(&format!("symbol={symbol},result=success"));
            Ok([
                Leg {
                    venue: long_venue.to_string(),
                    side: PositionSide::Long,
                    entry_price: long_rec.avg_fill_price,
                    current_price: long_rec.avg_fill_price,
                    quantity: long_rec.filled_qty,
                    unrealized_pnl: 0.0,
                },
                Leg {
                    venue: short_venue.to_string(),
                    side: PositionSide::Short,
                    entry_price: short_rec.avg_fill_price,
                    current_price: short_rec.avg_fill_price,
                    quantity: short_rec.filled_qty,
                    unrealized_pnl: 0.0,
                },
            ])
        }
        (Ok(long_rec), Err(short_err)) => {
            let rollback_outcome = rollback
                .rollback_filled_leg(
                    pair_id,
                    symbol,
                    PositionSide::Long,
                    long_venue,
                    long_rec.filled_qty,
                    long_rec.avg_fill_price,
                    short_venue,
                    &short_err,
                    adapters,
                    metrics,
                )
                .await;
            if rollback_outcome.is_success() {
                Err(ExecutionError::SecondLegFailed {
                    failed_side: "short",
                    rolled_back_side: "long",
                    detail: short_err,
                })
            } else {
                Err(ExecutionError::RollbackFailed {
                    failed_side: "short",
                    rolled_back_side: "long",
                    detail: short_err,
                })
            }
        }
        (Err(long_err), Ok(short_rec)) => {
            let rollback_outcome = rollback
                .rollback_filled_leg(
                    pair_id,
                    symbol,
                    PositionSide::Short,
                    short_venue,
                    short_rec.filled_qty,
                    short_rec.avg_fill_price,
                    long_venue,
                    &long_err,
                    adapters,
                    metrics,
                )
                .await;
            if rollback_outcome.is_success() {
                Err(ExecutionError::SecondLegFailed {
                    failed_side: "long",
                    rolled_back_side: "short",
                    detail: long_err,
                })
            } else {
                Err(ExecutionError::RollbackFailed {
                    failed_side: "long",
                    rolled_back_side: "short",
                    detail: long_err,
                })
            }
        }
        (Err(long_err), Err(short_err)) => {
            metrics.trades_total.incr(&format!("symbol={symbol},result=failed"));
            if long_timed_out && short_timed_out {
                Err(ExecutionError::Timeout)
            } else {
                Err(ExecutionError::BothLegsFailed { long_err, short_err })
            }
        }
    }
}

/// Close both legs concurrently; returns the summed realized PnL.
pub async fn close_parallel(
    adapters: &HashMap<String, Arc<dyn VenueAdapter>>,
    legs: &[Leg; 2],
    symbol: &str,
    order_timeout: Duration,
) -> Result<f64, ExecutionError> {
    let leg_a = &legs[0];
    let leg_b = &legs[1];
    let adapter_a = adapters
        .get(&leg_a.venue)
        .cloned()
        .ok_or_else(|| ExecutionError::AdapterMissing(leg_a.venue.clone()))?;
    let adapter_b = adapters
        .get(&leg_b.venue)
        .cloned()
        .ok_or_else(|| ExecutionError::AdapterMissing(leg_b.venue.clone()))?;

    let symbol_owned = symbol.to_string();
    let fut_a = tokio::time::timeout(
        order_timeout,
        adapter_a.close_position(&symbol_owned, leg_a.side, leg_a.quantity),
    );
    let fut_b = tokio::time::timeout(
        order_timeout,
        adapter_b.close_position(&symbol_owned, leg_b.side, leg_b.quantity),
    );
    let (res_a, res_b) = tokio::join!(fut_a, fut_b);

    let rec_a = res_a
        .map_err(|_| ExecutionError::Timeout)?
        .map_err(|e| ExecutionError::BothLegsFailed { long_err: e.to_string(), short_err: String::new() })?;
    let rec_b = res_b
        .map_err(|_| ExecutionError::Timeout)?
        .map_err(|e| ExecutionError::BothLegsFailed { long_err: String::new(), short_err: e.to_string() })?;

    Ok(leg_pnl(leg_a, rec_a.avg_fill_price) + leg_pnl(leg_b, rec_b.avg_fill_price))
}

/// Result of a (possibly early-aborted) multi-part entry.
#[derive(Debug, Clone)]
pub struct PartialEntryResult {
    pub legs: [Leg; 2],
    pub filled_parts: u32,
}

/// Execute `n_orders` sequential sub-entries of `total_volume / n_orders`.
/// Before each sub-entry after the first, `recheck_net_spread` is called; if
/// it returns `None` (opportunity gone) or a spread below
/// `entry_spread_pct * softening_factor`, stop and report whatever filled so
/// far rather than erroring.
#[allow(clippy::too_many_arguments)]
pub async fn execute_partial_entry<F>(
    adapters: &HashMap<String, Arc<dyn VenueAdapter>>,
    pair_id: &str,
    symbol: &str,
    total_volume: f64,
    n_orders: u32,
    long_venue: &str,
    short_venue: &str,
    entry_spread_pct: f64,
    softening_factor: f64,
    order_timeout: Duration,
    rollback: &RollbackHandler,
    metrics: &Metrics,
    mut recheck_net_spread: F,
) -> Result<PartialEntryResult, ExecutionError>
where
    F: FnMut() -> Option<f64>,
{
    let n_orders = n_orders.max(1);
    let sub_volume = total_volume / n_orders as f64;

    let mut long_qty = 0.0;
    let mut short_qty = 0.0;
    let mut long_notional = 0.0;
    let mut short_notional = 0.0;
    let mut filled_parts = 0u32;
    let mut first_error = None;

    for i in 0..n_orders {
        if i > 0 {
            let still_viable = match recheck_net_spread() {
                Some(net_spread) => net_spread >= entry_spread_pct * softening_factor,
                None => false,
            };
            if !still_viable {
                break;
            }
        }

        match execute_parallel(
            adapters,
            pair_id,
            symbol,
            sub_volume,
            long_venue,
            short_venue,
            order_timeout,
            rollback,
            metrics,
        )
        .await
        {
            Ok([long_leg, short_leg]) => {
                long_qty += long_leg.quantity;
                short_qty += short_leg.quantity;
                long_notional += long_leg.quantity * long_leg.entry_price;
                short_notional += short_leg.quantity * short_leg.entry_price;
                filled_parts += 1;
            }
            Err(e) => {
                if i == 0 {
                    first_error = Some(e);
                }
                break;
            }
        }
    }

    if filled_parts == 0 {
        return Err(first_error.unwrap_or(ExecutionError::Timeout));
    }

    let avg_long_price = long_notional / long_qty;
    let avg_short_price = short_notional / short_qty;
    Ok(PartialEntryResult {
        legs: [
            Leg {
                venue: long_venue.to_string(),
                side: PositionSide::Long,
                entry_price: avg_long_price,
                current_price: avg_long_price,
                quantity: long_qty,
                unrealized_pnl: 0.0,
            },
            Leg {
                venue: short_venue.to_string(),
                side: PositionSide::Short,
                entry_price: avg_short_price,
                current_price: avg_short_price,
                quantity: short_qty,
                unrealized_pnl: 0.0,
            },
        ],
        filled_parts,
    })
}
