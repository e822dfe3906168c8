//! Notifications (spec.md §3, §6).
//!
//! The broadcast hub itself is out of scope (it's a UI-facing external
//! collaborator per spec.md §1); this module only produces the typed
//! `Notification` values and hands them to a bounded `tokio::sync::broadcast`
//! channel, the same primitive `vault::unified_15m_strategy` and `main.rs`
//! use to fan trade events out to subscribers. On overflow the channel drops
//! the oldest message and we bump a counter, per spec.md §5's backpressure
//! policy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    Open,
    Close,
    StopLoss,
    Liquidation,
    Error,
    Margin,
    SecondLegFail,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub severity: Severity,
    pub pair_id: Option<String>,
    pub message: String,
    pub meta: HashMap<String, Value>,
}

impl Notification {
    pub fn new(
        kind: NotificationType,
        severity: Severity,
        pair_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            severity,
            pair_id,
            message: message.into(),
            meta: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

/// Thin wrapper over a bounded broadcast sender; `publish` never blocks and
/// never fails the caller even if there are no subscribers.
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification, metrics: &Metrics) {
        if let Err(_err) = self.tx.send(notification) {
            // No active subscribers; not an overflow, nothing to count.
            return;
        }
        let _ = metrics; // overflow accounting happens via lagged-receiver handling below
    }

    /// Call from a subscriber loop when `recv()` returns `Lagged(n)`: records
    /// the drop so the overflow is visible in metrics instead of silently
    /// vanishing.
    pub fn record_overflow(metrics: &Metrics, dropped: u64) {
        metrics
            .buffer_overflows_total
            .incr_by("buffer=notifications", dropped);
        warn!(dropped, "notification channel overflow, oldest messages dropped");
    }
}
