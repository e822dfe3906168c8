//! Risk monitor (spec.md §4.8).
//!
//! A single cooperative task ticking on an interval. Each tick snapshots the
//! pairs currently in `Holding`, re-prices them against fresh quotes, and
//! closes out any pair that has hit its stop-loss or faded back below its
//! exit spread. Liquidation events arrive separately and take the aggressive
//! emergency-close path on whichever leg survived.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info};

use crate::config::FeeTable;
use crate::executor;
use crate::metrics::Metrics;
use crate::notify::{Notification, NotificationBus, NotificationType, Severity};
use crate::pair::{PairHandle, PairState};
use crate::quotes::QuoteAggregator;
use crate::spread::SpreadEvaluator;
use crate::venue::{LiquidationEvent, PositionSide, VenueAdapter};

pub struct RiskMonitor {
    pairs: Vec<Arc<PairHandle>>,
    aggregator: Arc<QuoteAggregator>,
    fees: Arc<RwLock<FeeTable>>,
    default_taker_fee: f64,
    adapters: Arc<HashMap<String, Arc<dyn VenueAdapter>>>,
    notifications: Arc<NotificationBus>,
    metrics: Arc<Metrics>,
    order_timeout: Duration,
    tick_interval: Duration,
    emergency_max_retries: u32,
    emergency_retry_backoff: Duration,
}

impl RiskMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pairs: Vec<Arc<PairHandle>>,
        aggregator: Arc<QuoteAggregator>,
        fees: Arc<RwLock<FeeTable>>,
        default_taker_fee: f64,
        adapters: Arc<HashMap<String, Arc<dyn VenueAdapter>>>,
        notifications: Arc<NotificationBus>,
        metrics: Arc<Metrics>,
        order_timeout: Duration,
        tick_interval: Duration,
        emergency_max_retries: u32,
        emergency_retry_backoff: Duration,
    ) -> Self {
        Self {
            pairs,
            aggregator,
            fees,
            default_taker_fee,
            adapters,
            notifications,
            metrics,
            order_timeout,
            tick_interval,
            emergency_max_retries,
            emergency_retry_backoff,
        }
    }

    /// Runs forever on `tick_interval`. Spawn this once from the engine.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One pass over pairs currently in `Holding`.
    pub async fn tick(&self) {
        let holding: Vec<Arc<PairHandle>> = self
            .pairs
            .iter()
            .filter(|p| p.state() == PairState::Holding)
            .cloned()
            .collect();

        for pair in holding {
            self.evaluate_pair(&pair).await;
        }
    }

    async fn evaluate_pair(&self, pair: &Arc<PairHandle>) {
        let legs = pair.legs();
        if legs.len() != 2 {
            return;
        }
        let (long_leg, short_leg) = match (
            legs.iter().find(|l| l.side == PositionSide::Long),
            legs.iter().find(|l| l.side == PositionSide::Short),
        ) {
            (Some(l), Some(s)) => (l.clone(), s.clone()),
            _ => return,
        };

        let cfg = pair.config.read().clone();

        let fees = self.fees.read();
        let evaluator = SpreadEvaluator::new(&self.aggregator, &fees, self.default_taker_fee);
        let (current_spread, _) = evaluator.current_spread(&cfg.symbol, &long_leg.venue, &short_leg.venue);
        let unrealized_pnl = evaluator.pnl(
            &cfg.symbol,
            &long_leg.venue,
            &short_leg.venue,
            long_leg.entry_price,
            short_leg.entry_price,
            long_leg.quantity,
        );
        let live_prices = evaluator.live_close_prices(&cfg.symbol, &long_leg.venue, &short_leg.venue);
        drop(fees);

        let (long_current, short_current) =
            live_prices.unwrap_or((long_leg.current_price, short_leg.current_price));
        let long_pnl = (long_current - long_leg.entry_price) * long_leg.quantity;
        let short_pnl = (short_leg.entry_price - short_current) * short_leg.quantity;
        pair.update_pricing(current_spread, unrealized_pnl, long_current, long_pnl, short_current, short_pnl);

        if cfg.stop_loss > 0.0 && unrealized_pnl <= -cfg.stop_loss {
            self.close_pair(pair, &legs, PairState::Paused, NotificationType::StopLoss, "stop-loss hit")
                .await;
            self.metrics.stop_loss_triggered_total.incr(&cfg.symbol);
            return;
        }

        if current_spread <= cfg.exit_spread_pct {
            self.close_pair(
                pair,
                &legs,
                PairState::Ready,
                NotificationType::Close,
                "exit spread reached, pair re-armed",
            )
            .await;
        }
    }

    async fn close_pair(
        &self,
        pair: &Arc<PairHandle>,
        legs: &[crate::pair::Leg],
        on_success: PairState,
        kind: NotificationType,
        message: &str,
    ) {
        let pair_id = pair.id();
        if pair.try_transition(PairState::Exiting).is_err() {
            return;
        }
        let legs_array: [crate::pair::Leg; 2] = [legs[0].clone(), legs[1].clone()];
        match executor::close_parallel(&self.adapters, &legs_array, &pair.config.read().symbol, self.order_timeout).await {
            Ok(realized_pnl) => {
                let _ = pair.close_with_legs_cleared(on_success, realized_pnl);
                self.notifications.publish(
                    Notification::new(kind, Severity::Info, Some(pair_id.clone()), message.to_string())
                        .with_meta("realized_pnl", realized_pnl),
                    &self.metrics,
                );
                self.metrics.trades_total.incr(&format!("pair={pair_id},result=success"));
            }
            Err(e) => {
                pair.force_transition(PairState::Error, &self.metrics);
                error!(pair_id, error = %e, "failed to close pair on risk trigger");
                self.notifications.publish(
                    Notification::new(
                        NotificationType::Error,
                        Severity::Critical,
                        Some(pair_id.clone()),
                        format!("failed to close pair: {e}"),
                    ),
                    &self.metrics,
                );
            }
        }
    }

    /// Handle a venue-reported liquidation: force the pair into `Exiting`,
    /// aggressively close the surviving leg, and always emit a notification.
    pub async fn handle_liquidation(&self, event: LiquidationEvent) {
        let pair = self.pairs.iter().find(|p| {
            p.state() == PairState::Holding
                && p.legs().iter().any(|l| l.venue == event.venue && l.side == event.side)
        });

        let Some(pair) = pair else {
            self.notifications.publish(
                Notification::new(
                    NotificationType::Liquidation,
                    Severity::Critical,
                    None,
                    format!("liquidation reported on {} {} but no matching Holding pair found", event.venue, event.symbol),
                ),
                &self.metrics,
            );
            self.metrics
                .liquidations_detected_total
                .incr(&format!("venue={},symbol={}", event.venue, event.symbol));
            return;
        };

        let pair_id = pair.id();
        self.metrics
            .liquidations_detected_total
            .incr(&format!("venue={},symbol={}", event.venue, event.symbol));

        let legs = pair.legs();
        let surviving = legs.iter().find(|l| l.venue != event.venue).cloned();

        pair.force_transition(PairState::Exiting, &self.metrics);

        let Some(surviving) = surviving else {
            pair.force_transition(PairState::Error, &self.metrics);
            self.notifications.publish(
                Notification::new(
                    NotificationType::Liquidation,
                    Severity::Critical,
                    Some(pair_id),
                    "liquidation event left no identifiable surviving leg".to_string(),
                ),
                &self.metrics,
            );
            return;
        };

        let Some(adapter) = self.adapters.get(&surviving.venue).cloned() else {
            pair.force_transition(PairState::Error, &self.metrics);
            self.notifications.publish(
                Notification::new(
                    NotificationType::Liquidation,
                    Severity::Critical,
                    Some(pair_id),
                    format!("no adapter for surviving venue {}", surviving.venue),
                ),
                &self.metrics,
            );
            return;
        };

        let symbol = pair.config.read().symbol.clone();
        let mut attempt = 0u32;
        let result = loop {
            match adapter.close_position(&symbol, surviving.side, surviving.quantity).await {
                Ok(record) => break Ok(record.avg_fill_price),
                Err(e) => {
                    if attempt >= self.emergency_max_retries {
                        break Err(e.to_string());
                    }
                    attempt += 1;
                    tokio::time::sleep(self.emergency_retry_backoff * attempt).await;
                }
            }
        };

        match result {
            Ok(close_price) => {
                let realized = match surviving.side {
                    PositionSide::Long => (close_price - surviving.entry_price) * surviving.quantity,
                    PositionSide::Short => (surviving.entry_price - close_price) * surviving.quantity,
                };
                let _ = pair.close_with_legs_cleared(PairState::Paused, realized);
                info!(pair_id = %pair.id(), close_price, "emergency close after liquidation succeeded");
                self.notifications.publish(
                    Notification::new(
                        NotificationType::Liquidation,
                        Severity::Critical,
                        Some(pair.id()),
                        "liquidation detected; surviving leg emergency-closed".to_string(),
                    )
                    .with_meta("realized_pnl", realized),
                    &self.metrics,
                );
            }
            Err(detail) => {
                pair.force_transition(PairState::Error, &self.metrics);
                error!(pair_id = %pair.id(), detail, "emergency close after liquidation failed");
                self.notifications.publish(
                    Notification::new(
                        NotificationType::Liquidation,
                        Severity::Critical,
                        Some(pair.id()),
                        format!("liquidation detected; emergency close failed: {detail}"),
                    ),
                    &self.metrics,
                );
            }
        }
    }
}
