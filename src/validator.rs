//! Order validator (spec.md §4.4).
//!
//! A small read-mostly cache of venue trading limits plus pure qty-snapping
//! logic. The cache is populated lazily from a `VenueAdapter::trading_limits`
//! call and may go stale; when an entry is missing, built-in conservative
//! defaults are used and every resulting warning says so, mirroring the
//! "cache miss falls back to a documented default, never panics" idiom used
//! throughout `vault::unified_15m_strategy`'s config loading.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;

use crate::venue::TradingLimits;

#[derive(Debug, Clone, Copy)]
pub struct ValidatorCacheEntry {
    pub limits: TradingLimits,
    pub last_updated: Instant,
}

/// Outcome of a successful validation: the (possibly snapped/clamped)
/// quantity plus any non-fatal warnings accumulated along the way.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub qty: f64,
    pub warnings: Vec<String>,
}

/// Validation rejection. Not an error type — a normal, expected outcome of
/// checking an order against venue limits (spec.md §7: "validation failures
/// ... returned to caller, never retried").
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationReject {
    BelowMinQty { qty: f64, min_qty: f64 },
    BelowMinNotional { min_qty_required: f64 },
}

impl std::fmt::Display for ValidationReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationReject::BelowMinQty { qty, min_qty } => {
                write!(f, "qty {qty} below venue minimum {min_qty}")
            }
            ValidationReject::BelowMinNotional { min_qty_required } => write!(
                f,
                "order notional below venue minimum; would need qty >= {min_qty_required}"
            ),
        }
    }
}

const DEFAULT_LIMITS: TradingLimits = TradingLimits {
    min_qty: 0.001,
    max_qty: 100.0,
    qty_step: 0.001,
    min_notional: 5.0,
    price_tick: 0.01,
    max_leverage: 10.0,
};

pub struct OrderValidator {
    cache: RwLock<HashMap<(String, String), ValidatorCacheEntry>>,
}

impl Default for OrderValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderValidator {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn populate(&self, venue: &str, symbol: &str, limits: TradingLimits) {
        self.cache.write().insert(
            (venue.to_string(), symbol.to_string()),
            ValidatorCacheEntry {
                limits,
                last_updated: Instant::now(),
            },
        );
    }

    fn limits_for(&self, venue: &str, symbol: &str) -> (TradingLimits, bool) {
        match self.cache.read().get(&(venue.to_string(), symbol.to_string())) {
            Some(entry) => (entry.limits, true),
            None => (DEFAULT_LIMITS, false),
        }
    }

    /// Public accessor for callers (e.g. the entry evaluator's margin check)
    /// that need a venue's leverage cap but don't need a full `validate_qty`
    /// call.
    pub fn trading_limits(&self, venue: &str, symbol: &str) -> TradingLimits {
        self.limits_for(venue, symbol).0
    }

    /// Snap down to `qty_step`, reject below `min_qty`, clamp to `max_qty`
    /// with a warning, then reject if the resulting notional is below
    /// `min_notional` (reporting the minimum qty that would clear it).
    pub fn validate_qty(
        &self,
        venue: &str,
        symbol: &str,
        qty: f64,
        reference_price: f64,
    ) -> Result<ValidationOutcome, ValidationReject> {
        let (limits, from_cache) = self.limits_for(venue, symbol);
        let mut warnings = Vec::new();
        if !from_cache {
            warnings.push(format!(
                "{venue}/{symbol}: no cached trading limits, using built-in defaults"
            ));
        }

        let mut adjusted = snap_down(qty, limits.qty_step);
        if (adjusted - qty).abs() > f64::EPSILON {
            warnings.push(format!(
                "{venue}/{symbol}: qty adjusted from {qty} to {adjusted} (lot step {})",
                limits.qty_step
            ));
        }

        if adjusted < limits.min_qty {
            return Err(ValidationReject::BelowMinQty {
                qty: adjusted,
                min_qty: limits.min_qty,
            });
        }

        if adjusted > limits.max_qty {
            warnings.push(format!(
                "{venue}/{symbol}: qty clamped from {adjusted} to venue max {}",
                limits.max_qty
            ));
            adjusted = limits.max_qty;
        }

        if adjusted * reference_price < limits.min_notional {
            let min_qty_required = snap_up(limits.min_notional / reference_price, limits.qty_step);
            return Err(ValidationReject::BelowMinNotional { min_qty_required });
        }

        Ok(ValidationOutcome {
            qty: adjusted,
            warnings,
        })
    }

    /// Validate both legs of an entry and return the minimum of the two
    /// adjusted quantities so both legs transact the same size.
    pub fn validate_both_legs(
        &self,
        long_venue: &str,
        short_venue: &str,
        symbol: &str,
        qty: f64,
        long_price: f64,
        short_price: f64,
    ) -> Result<ValidationOutcome, ValidationReject> {
        let long = self.validate_qty(long_venue, symbol, qty, long_price)?;
        let short = self.validate_qty(short_venue, symbol, qty, short_price)?;
        let mut warnings = long.warnings;
        warnings.extend(short.warnings);
        Ok(ValidationOutcome {
            qty: long.qty.min(short.qty),
            warnings,
        })
    }
}

fn snap_down(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    (qty / step).floor() * step
}

fn snap_up(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    (qty / step).ceil() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> TradingLimits {
        TradingLimits {
            min_qty: 0.01,
            max_qty: 10.0,
            qty_step: 0.01,
            min_notional: 10.0,
            price_tick: 0.01,
            max_leverage: 20.0,
        }
    }

    #[test]
    fn snaps_down_to_lot_step_and_warns() {
        let v = OrderValidator::new();
        v.populate("binance", "BTCUSDT", limits());
        let outcome = v.validate_qty("binance", "BTCUSDT", 0.127, 50_000.0).unwrap();
        assert!((outcome.qty - 0.12).abs() < 1e-9);
        assert!(outcome.warnings.iter().any(|w| w.contains("adjusted")));
    }

    #[test]
    fn rejects_below_min_qty() {
        let v = OrderValidator::new();
        v.populate("binance", "BTCUSDT", limits());
        let err = v.validate_qty("binance", "BTCUSDT", 0.001, 50_000.0).unwrap_err();
        assert!(matches!(err, ValidationReject::BelowMinQty { .. }));
    }

    #[test]
    fn clamps_to_max_qty_with_warning() {
        let v = OrderValidator::new();
        v.populate("binance", "BTCUSDT", limits());
        let outcome = v.validate_qty("binance", "BTCUSDT", 50.0, 50_000.0).unwrap();
        assert_eq!(outcome.qty, 10.0);
        assert!(outcome.warnings.iter().any(|w| w.contains("clamped")));
    }

    #[test]
    fn rejects_below_min_notional_with_required_qty() {
        let v = OrderValidator::new();
        v.populate("binance", "BTCUSDT", limits());
        let err = v.validate_qty("binance", "BTCUSDT", 0.01, 50.0).unwrap_err();
        match err {
            ValidationReject::BelowMinNotional { min_qty_required } => {
                assert!(min_qty_required * 50.0 >= 10.0);
            }
            _ => panic!("expected BelowMinNotional"),
        }
    }

    #[test]
    fn missing_cache_entry_uses_defaults_and_warns() {
        let v = OrderValidator::new();
        let outcome = v.validate_qty("unknown-venue", "BTCUSDT", 1.0, 50_000.0).unwrap();
        assert!(outcome.warnings.iter().any(|w| w.contains("built-in defaults")));
    }

    #[test]
    fn validate_both_legs_returns_minimum_adjusted_qty() {
        let v = OrderValidator::new();
        v.populate("binance", "BTCUSDT", limits());
        let mut tighter = limits();
        tighter.qty_step = 0.1;
        v.populate("okx", "BTCUSDT", tighter);
        let outcome = v
            .validate_both_legs("binance", "okx", "BTCUSDT", 0.25, 50_000.0, 50_100.0)
            .unwrap();
        assert!((outcome.qty - 0.2).abs() < 1e-9);
    }
}
