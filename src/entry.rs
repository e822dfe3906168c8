//! Entry evaluator (spec.md §4.6).
//!
//! Runs the ordered gating checks — concurrency cap, opportunity presence,
//! liquidity, spread threshold, order validation, margin — and stops at the
//! first failure. On any rejection the `Opportunity` carrier goes back to
//! its pool instead of being dropped; only on acceptance does ownership pass
//! to the caller (eventually the executor).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::FeeTable;
use crate::liquidity::BookLiquidityAnalyzer;
use crate::pair::PairConfig;
use crate::pool::Pool;
use crate::quotes::QuoteAggregator;
use crate::spread::{Opportunity, SpreadEvaluator};
use crate::validator::{OrderValidator, ValidationReject};
use crate::venue::VenueAdapter;

#[derive(Debug, Clone, Copy)]
pub struct MarginCacheEntry {
    pub available_balance: f64,
    pub used_margin: f64,
    pub total_equity: f64,
    pub last_updated: Instant,
}

/// Why an entry was rejected. Not an error — spec.md §7 calls this a normal
/// steady-state outcome, never retried automatically.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    MaxConcurrentReached,
    NoOpportunity,
    LiquidityInsufficient(String),
    SpreadBelowThreshold { net_spread: f64, required: f64 },
    Validation(ValidationReject),
    MarginDeficit { venue: String, required: f64, available: f64 },
    BalanceUnavailable { venue: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MaxConcurrentReached => write!(f, "max concurrent arbitrages reached"),
            RejectReason::NoOpportunity => write!(f, "no opportunity available"),
            RejectReason::LiquidityInsufficient(detail) => {
                write!(f, "insufficient liquidity: {detail}")
            }
            RejectReason::SpreadBelowThreshold { net_spread, required } => write!(
                f,
                "net spread {net_spread:.4}% below entry threshold {required:.4}%"
            ),
            RejectReason::Validation(reject) => write!(f, "{reject}"),
            RejectReason::MarginDeficit { venue, required, available } => write!(
                f,
                "{venue}: insufficient margin, need {required:.2} have {available:.2}"
            ),
            RejectReason::BalanceUnavailable { venue } => {
                write!(f, "{venue}: balance unavailable (cache miss and fetch failed)")
            }
        }
    }
}

/// A verified entry candidate, ready for the executor.
pub struct CanEnter {
    pub opportunity: Opportunity,
    pub qty: f64,
    pub warnings: Vec<String>,
}

pub struct EntryEvaluator {
    aggregator: Arc<QuoteAggregator>,
    fees: Arc<RwLock<FeeTable>>,
    liquidity: Option<Arc<BookLiquidityAnalyzer>>,
    validator: Arc<OrderValidator>,
    opp_pool: Arc<Pool<Opportunity>>,
    default_taker_fee: f64,
    margin_safety_buffer: f64,
    balance_fetch_timeout: Duration,
    margin_cache: RwLock<HashMap<(String, String), MarginCacheEntry>>,
}

impl EntryEvaluator {
    pub fn new(
        aggregator: Arc<QuoteAggregator>,
        fees: Arc<RwLock<FeeTable>>,
        liquidity: Option<Arc<BookLiquidityAnalyzer>>,
        validator: Arc<OrderValidator>,
        opp_pool: Arc<Pool<Opportunity>>,
        default_taker_fee: f64,
        margin_safety_buffer: f64,
        balance_fetch_timeout: Duration,
    ) -> Self {
        Self {
            aggregator,
            fees,
            liquidity,
            validator,
            opp_pool,
            default_taker_fee,
            margin_safety_buffer,
            balance_fetch_timeout,
            margin_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Return an accepted opportunity's carrier to the pool once the
    /// executor is done with it (spec.md §5: the gate never releases an
    /// accepted opportunity — ownership passes downstream).
    pub fn release_opportunity(&self, opportunity: Opportunity) {
        self.opp_pool.release(opportunity);
    }

    /// Seed the margin cache directly (e.g. from a periodic balance-refresh
    /// task) so `evaluate` doesn't need to hit the adapter on the hot path.
    pub fn seed_margin_cache(&self, venue: &str, symbol: &str, available_balance: f64) {
        self.margin_cache.write().insert(
            (venue.to_string(), symbol.to_string()),
            MarginCacheEntry {
                available_balance,
                used_margin: 0.0,
                total_equity: available_balance,
                last_updated: Instant::now(),
            },
        );
    }

    pub async fn evaluate(
        &self,
        pair_cfg: &PairConfig,
        current_active: i64,
        max_concurrent: usize,
        adapters: &HashMap<String, Arc<dyn VenueAdapter>>,
    ) -> Result<CanEnter, RejectReason> {
        if max_concurrent > 0 && current_active >= max_concurrent as i64 {
            return Err(RejectReason::MaxConcurrentReached);
        }

        let opportunity = {
            let fees = self.fees.read();
            let spread_eval = SpreadEvaluator::new(&self.aggregator, &fees, self.default_taker_fee);
            spread_eval.best_opportunity(&pair_cfg.symbol)
        };
        let opportunity = match opportunity {
            Some(o) => o,
            None => return Err(RejectReason::NoOpportunity),
        };

        let mut warnings = Vec::new();

        if let Some(liquidity) = &self.liquidity {
            let analysis = liquidity.analyze(
                &pair_cfg.symbol,
                pair_cfg.volume_asset,
                &opportunity.long_venue,
                &opportunity.short_venue,
            );
            if !analysis.is_liquidity_ok {
                let detail = if analysis.warnings.is_empty() {
                    "liquidity check failed".to_string()
                } else {
                    analysis.warnings.join("; ")
                };
                self.opp_pool.release(opportunity);
                return Err(RejectReason::LiquidityInsufficient(detail));
            }
            warnings.extend(analysis.warnings);
        }

        if opportunity.net_spread < pair_cfg.entry_spread_pct {
            let reason = RejectReason::SpreadBelowThreshold {
                net_spread: opportunity.net_spread,
                required: pair_cfg.entry_spread_pct,
            };
            self.opp_pool.release(opportunity);
            return Err(reason);
        }

        let validated = match self.validator.validate_both_legs(
            &opportunity.long_venue,
            &opportunity.short_venue,
            &pair_cfg.symbol,
            pair_cfg.volume_asset,
            opportunity.long_price,
            opportunity.short_price,
        ) {
            Ok(v) => v,
            Err(reject) => {
                self.opp_pool.release(opportunity);
                return Err(RejectReason::Validation(reject));
            }
        };
        warnings.extend(validated.warnings.clone());

        let legs = [
            (opportunity.long_venue.clone(), opportunity.long_price),
            (opportunity.short_venue.clone(), opportunity.short_price),
        ];
        for (venue, price) in legs {
            let limits = self.validator.trading_limits(&venue, &pair_cfg.symbol);
            let required = validated.qty * price / limits.max_leverage.max(1.0) * self.margin_safety_buffer;
            let available = match self
                .available_balance(&venue, &pair_cfg.symbol, adapters.get(&venue))
                .await
            {
                Ok(b) => b,
                Err(reason) => {
                    self.opp_pool.release(opportunity);
                    return Err(reason);
                }
            };
            if available < required {
                self.opp_pool.release(opportunity);
                return Err(RejectReason::MarginDeficit { venue, required, available });
            }
        }

        Ok(CanEnter {
            opportunity,
            qty: validated.qty,
            warnings,
        })
    }

    async fn available_balance(
        &self,
        venue: &str,
        symbol: &str,
        adapter: Option<&Arc<dyn VenueAdapter>>,
    ) -> Result<f64, RejectReason> {
        if let Some(entry) = self.margin_cache.read().get(&(venue.to_string(), symbol.to_string())) {
            return Ok(entry.available_balance);
        }
        let adapter = adapter.ok_or_else(|| RejectReason::BalanceUnavailable { venue: venue.to_string() })?;
        match tokio::time::timeout(self.balance_fetch_timeout, adapter.balance()).await {
            Ok(Ok(balance)) => {
                self.margin_cache.write().insert(
                    (venue.to_string(), symbol.to_string()),
                    MarginCacheEntry {
                        available_balance: balance,
                        used_margin: 0.0,
                        total_equity: balance,
                        last_updated: Instant::now(),
                    },
                );
                Ok(balance)
            }
            _ => Err(RejectReason::BalanceUnavailable { venue: venue.to_string() }),
        }
    }
}
