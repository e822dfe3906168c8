//! Composition root: wires shards, pairs, venue adapters, pools, and
//! metrics into one running engine, and spawns the risk monitor. Mirrors the
//! role of `main.rs`/`lib.rs` in the teacher crate — construct once, share
//! `Arc`s out to every component, spawn background tasks, return a handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::{EngineConfig, FeeTable};
use crate::entry::{CanEnter, EntryEvaluator, RejectReason};
use crate::error::ExecutionError;
use crate::executor;
use crate::liquidity::BookLiquidityAnalyzer;
use crate::metrics::Metrics;
use crate::notify::{Notification, NotificationBus, NotificationType, Severity};
use crate::pair::{Leg, PairConfig, PairHandle, PairState};
use crate::pool::Pool;
use crate::quotes::QuoteAggregator;
use crate::risk::RiskMonitor;
use crate::rollback::RollbackHandler;
use crate::spread::Opportunity;
use crate::validator::OrderValidator;
use crate::venue::VenueAdapter;

/// Everything the core needs, constructed once at startup and shared via
/// `Arc` with every component.
pub struct Engine {
    pub config: EngineConfig,
    pub aggregator: Arc<QuoteAggregator>,
    pub fees: Arc<RwLock<FeeTable>>,
    pub liquidity: Arc<BookLiquidityAnalyzer>,
    pub validator: Arc<OrderValidator>,
    pub adapters: Arc<HashMap<String, Arc<dyn VenueAdapter>>>,
    pub pairs: Vec<Arc<PairHandle>>,
    pub notifications: Arc<NotificationBus>,
    pub metrics: Arc<Metrics>,
    entry_evaluator: Arc<EntryEvaluator>,
    rollback: Arc<RollbackHandler>,
    risk_monitor: Arc<RiskMonitor>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        pair_configs: Vec<PairConfig>,
        adapters: HashMap<String, Arc<dyn VenueAdapter>>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let aggregator = Arc::new(QuoteAggregator::new(
            config.num_shards,
            config.workers_per_shard,
            config.shard_channel_capacity,
            metrics.clone(),
        ));
        let fees = Arc::new(RwLock::new(FeeTable::new()));
        let liquidity = Arc::new(BookLiquidityAnalyzer::new(
            config.book_depth,
            crate::liquidity::LiquidityThresholds {
                max_slippage_pct: config.slippage_warn_threshold_pct,
                book_ttl: config.book_ttl,
            },
        ));
        let validator = Arc::new(OrderValidator::new());
        let notifications = Arc::new(NotificationBus::new(config.notification_channel_capacity));
        let opp_pool = Arc::new(Pool::<Opportunity>::new(config.shard_channel_capacity));
        let adapters = Arc::new(adapters);

        let entry_evaluator = Arc::new(EntryEvaluator::new(
            aggregator.clone(),
            fees.clone(),
            Some(liquidity.clone()),
            validator.clone(),
            opp_pool,
            config.default_taker_fee,
            config.margin_safety_buffer,
            config.balance_fetch_timeout,
        ));

        let rollback = Arc::new(RollbackHandler::new(
            config.rollback_timeout,
            config.rollback_max_retries,
            config.retry_backoff,
            notifications.clone(),
        ));

        let pairs: Vec<Arc<PairHandle>> = pair_configs.into_iter().map(|c| Arc::new(PairHandle::new(c))).collect();

        let risk_monitor = Arc::new(RiskMonitor::new(
            pairs.clone(),
            aggregator.clone(),
            fees.clone(),
            config.default_taker_fee,
            adapters.clone(),
            notifications.clone(),
            metrics.clone(),
            config.order_timeout,
            config.risk_tick_interval,
            config.emergency_max_retries,
            config.emergency_retry_backoff,
        ));

        Self {
            config,
            aggregator,
            fees,
            liquidity,
            validator,
            adapters,
            pairs,
            notifications,
            metrics,
            entry_evaluator,
            rollback,
            risk_monitor,
        }
    }

    /// Spawn the risk monitor's periodic task. Returns its `JoinHandle` so
    /// the caller can manage shutdown.
    pub fn spawn_risk_monitor(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.risk_monitor.clone();
        tokio::spawn(async move {
            monitor.run().await;
        })
    }

    pub fn pair(&self, pair_id: &str) -> Option<Arc<PairHandle>> {
        self.pairs.iter().find(|p| p.id() == pair_id).cloned()
    }

    /// Lock-free fast-path scan over every configured pair; only pairs whose
    /// `is_ready` flag is set get a full `evaluate` call.
    pub async fn scan_for_entries(&self) -> Vec<(String, Result<CanEnter, RejectReason>)> {
        let mut results = Vec::new();
        let current_active = self.metrics.active_arbitrages();
        for pair in &self.pairs {
            if !pair.is_ready() {
                continue;
            }
            let cfg = pair.config.read().clone();
            let verdict = self
                .entry_evaluator
                .evaluate(&cfg, current_active, self.config.max_concurrent_arbs, &self.adapters)
                .await;
            results.push((cfg.id.clone(), verdict));
        }
        results
    }

    /// Claim a ready pair and drive it through entry. No-op if another
    /// caller already claimed it or it's no longer ready.
    pub async fn try_enter(&self, pair_id: &str) -> Option<Result<(), ExecutionError>> {
        let pair = self.pair(pair_id)?;
        if !pair.try_claim_for_entry() {
            return None;
        }

        let cfg = pair.config.read().clone();
        let current_active = self.metrics.active_arbitrages();
        let verdict = self
            .entry_evaluator
            .evaluate(&cfg, current_active, self.config.max_concurrent_arbs, &self.adapters)
            .await;

        let accepted = match verdict {
            Ok(a) => a,
            Err(reason) => {
                let _ = pair.try_transition(PairState::Ready);
                self.notifications.publish(
                    Notification::new(
                        NotificationType::Error,
                        Severity::Info,
                        Some(pair_id.to_string()),
                        format!("entry rejected: {reason}"),
                    ),
                    &self.metrics,
                );
                return Some(Ok(()));
            }
        };

        self.metrics.opportunities_detected_total.incr(&format!("symbol={},triggered=true", cfg.symbol));

        // Extract what the executor needs, then hand the carrier back to its
        // pool — the gate accepted it but never releases it itself.
        let qty = accepted.qty;
        let long_venue = accepted.opportunity.long_venue.clone();
        let short_venue = accepted.opportunity.short_venue.clone();
        self.entry_evaluator.release_opportunity(accepted.opportunity);

        let result = if cfg.n_orders > 1 {
            let fees = self.fees.clone();
            let aggregator = self.aggregator.clone();
            let default_fee = self.config.default_taker_fee;
            let symbol = cfg.symbol.clone();
            let recheck_long_venue = long_venue.clone();
            let recheck_short_venue = short_venue.clone();
            executor::execute_partial_entry(
                &self.adapters,
                &pair_id_owned(&cfg),
                &cfg.symbol,
                cfg.volume_asset,
                cfg.n_orders,
                &long_venue,
                &short_venue,
                cfg.entry_spread_pct,
                self.config.exit_spread_softening,
                self.config.order_timeout,
                &self.rollback,
                &self.metrics,
                move || {
                    let fees = fees.read();
                    let evaluator = SpreadEvaluatorRef::new(&aggregator, &fees, default_fee);
                    // "the current opportunity" (spec.md §4.7) for these two
                    // specific venues — if the best opportunity has moved to
                    // a different venue pair, treat it as gone.
                    evaluator.best_opportunity(&symbol).and_then(|opp| {
                        if opp.long_venue == recheck_long_venue && opp.short_venue == recheck_short_venue {
                            Some(opp.net_spread)
                        } else {
                            None
                        }
                    })
                },
            )
            .await
            .map(|r| (r.legs, r.filled_parts))
        } else {
            executor::execute_parallel(
                &self.adapters,
                &cfg.id,
                &cfg.symbol,
                qty,
                &long_venue,
                &short_venue,
                self.config.order_timeout,
                &self.rollback,
                &self.metrics,
            )
            .await
            .map(|legs| (legs, 1u32))
        };

        match result {
            Ok((legs, filled_parts)) => {
                if let Err(fault) = pair.enter_with_legs(legs, filled_parts) {
                    pair.force_transition(PairState::Error, &self.metrics);
                    info!(pair_id, %fault, "invariant violation entering Holding");
                    return Some(Err(ExecutionError::AdapterMissing("invariant".to_string())));
                }
                self.metrics.active_arbitrages.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.notifications.publish(
                    Notification::new(
                        NotificationType::Open,
                        Severity::Info,
                        Some(pair_id.to_string()),
                        "pair entered".to_string(),
                    ),
                    &self.metrics,
                );
                Some(Ok(()))
            }
            Err(e) => {
                let _ = pair.try_transition(PairState::Ready);
                Some(Err(e))
            }
        }
    }
}

fn pair_id_owned(cfg: &PairConfig) -> String {
    cfg.id.clone()
}

/// Thin re-export so the closure above doesn't need to borrow across an
/// await point awkwardly; identical to `spread::SpreadEvaluator`.
type SpreadEvaluatorRef<'a> = crate::spread::SpreadEvaluator<'a>;
