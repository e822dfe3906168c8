//! Second-leg-failure handler (spec.md §4.9).
//!
//! Invoked by the executor when exactly one leg of a two-leg order filled.
//! Submits a reversing order on the filled leg under its own deadline,
//! independent of the order-placement timeout that got it here, with one
//! retry budget. Always emits a notification — `warn` if the reversal
//! succeeded, `critical` (manual intervention) if it didn't.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, warn};

use crate::metrics::Metrics;
use crate::notify::{Notification, NotificationBus, NotificationType, Severity};
use crate::venue::{PositionSide, VenueAdapter};

#[derive(Debug, Clone)]
pub enum RollbackOutcome {
    Success { close_price: f64 },
    Failed { detail: String },
}

impl RollbackOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RollbackOutcome::Success { .. })
    }
}

pub struct RollbackHandler {
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    notifications: Arc<NotificationBus>,
}

impl RollbackHandler {
    pub fn new(
        timeout: Duration,
        max_retries: u32,
        retry_backoff: Duration,
        notifications: Arc<NotificationBus>,
    ) -> Self {
        Self {
            timeout,
            max_retries,
            retry_backoff,
            notifications,
        }
    }

    /// Reverse the filled leg (`filled_side` on `filled_venue`, `filled_qty`
    /// at `filled_price`) after `failed_venue` rejected its half of the
    /// entry. Emits the mandated notification before returning.
    #[allow(clippy::too_many_arguments)]
    pub async fn rollback_filled_leg(
        &self,
        pair_id: &str,
        symbol: &str,
        filled_side: PositionSide,
        filled_venue: &str,
        filled_qty: f64,
        filled_price: f64,
        failed_venue: &str,
        failed_error: &str,
        adapters: &HashMap<String, Arc<dyn VenueAdapter>>,
        metrics: &Metrics,
    ) -> RollbackOutcome {
        let outcome = match adapters.get(filled_venue) {
            Some(adapter) => {
                let adapter = adapter.clone();
                match tokio::time::timeout(
                    self.timeout,
                    Self::attempt_with_retries(
                        adapter,
                        symbol.to_string(),
                        filled_side,
                        filled_qty,
                        self.max_retries,
                        self.retry_backoff,
                    ),
                )
                .await
                {
                    Ok(Ok(close_price)) => RollbackOutcome::Success { close_price },
                    Ok(Err(detail)) => RollbackOutcome::Failed { detail },
                    Err(_) => RollbackOutcome::Failed {
                        detail: "rollback deadline expired before the reversing order confirmed".to_string(),
                    },
                }
            }
            None => RollbackOutcome::Failed {
                detail: format!("no adapter registered for {filled_venue}"),
            },
        };

        self.notify(
            pair_id,
            symbol,
            filled_side,
            filled_venue,
            filled_qty,
            filled_price,
            failed_venue,
            failed_error,
            &outcome,
            metrics,
        );

        match &outcome {
            RollbackOutcome::Success { .. } => metrics.trades_total.incr(&format!("symbol={symbol},result=rollback")),
            RollbackOutcome::Failed { .. } => {
                metrics.trades_total.incr(&format!("symbol={symbol},result=failed"))
            }
        }

        outcome
    }

    async fn attempt_with_retries(
        adapter: Arc<dyn VenueAdapter>,
        symbol: String,
        filled_side: PositionSide,
        qty: f64,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Result<f64, String> {
        let mut attempt = 0u32;
        loop {
            match adapter.close_position(&symbol, filled_side, qty).await {
                Ok(record) => return Ok(record.avg_fill_price),
                Err(err) => {
                    if !err.is_transient() || attempt >= max_retries {
                        return Err(err.to_string());
                    }
                    attempt += 1;
                    tokio::time::sleep(retry_backoff * attempt).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        pair_id: &str,
        symbol: &str,
        filled_side: PositionSide,
        filled_venue: &str,
        filled_qty: f64,
        filled_price: f64,
        failed_venue: &str,
        failed_error: &str,
        outcome: &RollbackOutcome,
        metrics: &Metrics,
    ) {
        let (severity, message, residual_loss_estimate) = match outcome {
            RollbackOutcome::Success { close_price } => (
                Severity::Warn,
                format!("{filled_venue} leg rolled back at {close_price} after {failed_venue} leg failed"),
                0.0,
            ),
            RollbackOutcome::Failed { detail } => {
                error!(pair_id, symbol, filled_venue, detail, "second-leg rollback failed, manual intervention required");
                (
                    Severity::Critical,
                    format!("{filled_venue} leg could not be rolled back after {failed_venue} leg failed: {detail}"),
                    filled_qty * filled_price,
                )
            }
        };

        if matches!(severity, Severity::Warn) {
            warn!(pair_id, symbol, filled_venue, failed_venue, "second-leg rollback succeeded");
        }

        let notification = Notification::new(
            NotificationType::SecondLegFail,
            severity,
            Some(pair_id.to_string()),
            message,
        )
        .with_meta("filled_venue", filled_venue)
        .with_meta("failed_venue", failed_venue)
        .with_meta("filled_side", json!(format!("{filled_side:?}")))
        .with_meta("failed_error", failed_error)
        .with_meta("rollback_succeeded", outcome.is_success())
        .with_meta("residual_pnl_loss_estimate", residual_loss_estimate);

        self.notifications.publish(notification, metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::{PaperVenueAdapter, PaperVenueAdapterConfig};

    fn adapters_with(name: &str, mark_price: f64) -> HashMap<String, Arc<dyn VenueAdapter>> {
        let adapter = PaperVenueAdapter::new(name, PaperVenueAdapterConfig::default());
        adapter.set_mark_price(mark_price);
        let mut m: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        m.insert(name.to_string(), Arc::new(adapter));
        m
    }

    #[tokio::test]
    async fn successful_rollback_reports_success() {
        let bus = Arc::new(NotificationBus::new(8));
        let handler = RollbackHandler::new(Duration::from_secs(5), 1, Duration::from_millis(10), bus.clone());
        let metrics = Metrics::new();
        let mut rx = bus.subscribe();

        let outcome = handler
            .rollback_filled_leg(
                "pair-1",
                "BTCUSDT",
                PositionSide::Long,
                "binance",
                0.1,
                50_000.0,
                "okx",
                "timeout",
                &adapters_with("binance", 50_000.0),
                &metrics,
            )
            .await;

        assert!(outcome.is_success());
        let n = rx.try_recv().unwrap();
        assert_eq!(n.severity, Severity::Warn);
    }

    #[tokio::test]
    async fn missing_adapter_fails_and_is_critical() {
        let bus = Arc::new(NotificationBus::new(8));
        let handler = RollbackHandler::new(Duration::from_secs(5), 1, Duration::from_millis(10), bus.clone());
        let metrics = Metrics::new();
        let mut rx = bus.subscribe();
        let empty: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();

        let outcome = handler
            .rollback_filled_leg(
                "pair-1", "BTCUSDT", PositionSide::Short, "binance", 0.1, 50_000.0, "okx", "timeout", &empty,
                &metrics,
            )
            .await;

        assert!(!outcome.is_success());
        let n = rx.try_recv().unwrap();
        assert_eq!(n.severity, Severity::Critical);
        assert_eq!(n.meta.get("rollback_succeeded").unwrap(), false);
    }
}
