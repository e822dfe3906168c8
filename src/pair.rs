//! Pair state machine (spec.md §4.5).
//!
//! One `PairHandle` per configured pair: a checked transition table plus an
//! atomic `is_ready` fast-path flag so the hot-path opportunity scan never
//! takes the pair mutex unless the pair might actually be enterable —
//! the double-checked-locking shape spec.md calls for explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CriticalFault;
use crate::metrics::Metrics;
use crate::venue::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairStatus {
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub id: String,
    pub symbol: String,
    pub entry_spread_pct: f64,
    pub exit_spread_pct: f64,
    pub volume_asset: f64,
    pub n_orders: u32,
    pub stop_loss: f64,
    pub status: PairStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairState {
    Paused,
    Ready,
    Entering,
    Holding,
    Exiting,
    Error,
}

/// Precomputed `from -> allowed to` table (spec.md §4.5); self-loops are
/// never present.
fn allowed_transitions(from: PairState) -> &'static [PairState] {
    use PairState::*;
    match from {
        Paused => &[Ready],
        Ready => &[Paused, Entering],
        Entering => &[Holding, Ready, Error],
        Holding => &[Exiting, Paused, Error],
        Exiting => &[Ready, Paused, Error],
        Error => &[Paused],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRejected {
    pub from: PairState,
    pub to: PairState,
}

impl std::fmt::Display for TransitionRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transition {:?} -> {:?} is not allowed", self.from, self.to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub venue: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub current_price: f64,
    pub quantity: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRuntime {
    pub pair_id: String,
    pub state: PairState,
    pub legs: Vec<Leg>,
    pub current_spread: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub filled_parts: u32,
    #[serde(skip, default = "Instant::now")]
    pub last_update: Instant,
}

impl PairRuntime {
    fn new(pair_id: String) -> Self {
        Self {
            pair_id,
            state: PairState::Paused,
            legs: Vec::new(),
            current_spread: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            filled_parts: 0,
            last_update: Instant::now(),
        }
    }

    /// `legs` is empty iff state ∈ {Paused,Ready,Entering,Error}; exactly 2,
    /// one long + one short on distinct venues, iff state ∈ {Holding,Exiting}.
    fn check_leg_invariant(&self) -> Result<(), CriticalFault> {
        let legs_ok = match self.state {
            PairState::Paused | PairState::Ready | PairState::Entering | PairState::Error => {
                self.legs.is_empty()
            }
            PairState::Holding | PairState::Exiting => {
                self.legs.len() == 2
                    && self.legs[0].side != self.legs[1].side
                    && self.legs[0].venue != self.legs[1].venue
            }
        };
        if legs_ok {
            Ok(())
        } else {
            Err(CriticalFault::InvariantViolation {
                pair_id: self.pair_id.clone(),
                detail: format!(
                    "state {:?} with {} leg(s) violates the leg-count invariant",
                    self.state,
                    self.legs.len()
                ),
            })
        }
    }
}

/// A single pair's full state: immutable identity, mutable config, mutable
/// runtime, and the `is_ready` fast-path flag.
pub struct PairHandle {
    pub config: RwLock<PairConfig>,
    runtime: Mutex<PairRuntime>,
    is_ready: AtomicBool,
}

impl PairHandle {
    pub fn new(config: PairConfig) -> Self {
        let pair_id = config.id.clone();
        Self {
            config: RwLock::new(config),
            runtime: Mutex::new(PairRuntime::new(pair_id)),
            is_ready: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> String {
        self.config.read().id.clone()
    }

    pub fn state(&self) -> PairState {
        self.runtime.lock().state
    }

    pub fn snapshot(&self) -> PairRuntime {
        self.runtime.lock().clone()
    }

    /// Lock-free read used by the entry scan's hot path.
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    /// The only transition permitted on common paths: rejects anything not
    /// in the precomputed table.
    pub fn try_transition(&self, to: PairState) -> Result<(), TransitionRejected> {
        let mut runtime = self.runtime.lock();
        self.transition_locked(&mut runtime, to, false)
    }

    /// Bypasses the transition table; reserved for liquidation and
    /// catastrophic paths. Always emits a metrics event since it is, by
    /// construction, not a normal-path transition.
    pub fn force_transition(&self, to: PairState, metrics: &Metrics) {
        let mut runtime = self.runtime.lock();
        let from = runtime.state;
        runtime.state = to;
        runtime.last_update = Instant::now();
        self.sync_is_ready_flag(from, to);
        metrics.events_processed.incr("type=force_transition");
        warn!(pair_id = %runtime.pair_id, ?from, ?to, "forced pair transition");
    }

    fn transition_locked(
        &self,
        runtime: &mut PairRuntime,
        to: PairState,
        _bypass: bool,
    ) -> Result<(), TransitionRejected> {
        let from = runtime.state;
        if from == to || !allowed_transitions(from).contains(&to) {
            return Err(TransitionRejected { from, to });
        }
        runtime.state = to;
        runtime.last_update = Instant::now();
        self.sync_is_ready_flag(from, to);
        Ok(())
    }

    fn sync_is_ready_flag(&self, from: PairState, to: PairState) {
        if to == PairState::Ready {
            self.is_ready.store(true, Ordering::Release);
        } else if from == PairState::Ready {
            self.is_ready.store(false, Ordering::Release);
        }
    }

    /// Double-checked fast path: if `is_ready` isn't set, returns `false`
    /// without locking. Otherwise locks, re-verifies the state is still
    /// `Ready`, and atomically transitions to `Entering`, clearing the flag.
    /// Returns `true` only if this call won the race to enter.
    pub fn try_claim_for_entry(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        let mut runtime = self.runtime.lock();
        if runtime.state != PairState::Ready {
            return false;
        }
        self.transition_locked(&mut runtime, PairState::Entering, false).is_ok()
    }

    /// Attach the two filled legs after a successful entry; only valid from
    /// `Entering` while transitioning into `Holding`. `filled_parts` is the
    /// number of sub-entry orders that actually filled (1 for a single-order
    /// entry, up to `n_orders` for a partial entry).
    pub fn enter_with_legs(&self, legs: [Leg; 2], filled_parts: u32) -> Result<(), CriticalFault> {
        let mut runtime = self.runtime.lock();
        self.transition_locked(&mut runtime, PairState::Holding, false)
            .map_err(|e| CriticalFault::InvariantViolation {
                pair_id: runtime.pair_id.clone(),
                detail: e.to_string(),
            })?;
        runtime.legs = legs.to_vec();
        runtime.filled_parts = filled_parts;
        runtime.check_leg_invariant()
    }

    /// Clear legs and realized PnL bookkeeping on a successful close,
    /// transitioning to `to` (`Ready` for a normal exit, `Paused` for a
    /// stop-loss or post-rollback pause).
    pub fn close_with_legs_cleared(&self, to: PairState, realized_pnl: f64) -> Result<(), CriticalFault> {
        let mut runtime = self.runtime.lock();
        self.transition_locked(&mut runtime, to, false)
            .map_err(|e| CriticalFault::InvariantViolation {
                pair_id: runtime.pair_id.clone(),
                detail: e.to_string(),
            })?;
        runtime.legs.clear();
        runtime.realized_pnl += realized_pnl;
        runtime.filled_parts = 0;
        runtime.check_leg_invariant()
    }

    /// Refresh the pair-level spread/PnL summary and, when both legs are
    /// present, each leg's own `current_price`/`unrealized_pnl` (legs are
    /// always stored `[long, short]`, the order the executor produces them
    /// in — see spec.md §3's Leg model).
    #[allow(clippy::too_many_arguments)]
    pub fn update_pricing(
        &self,
        current_spread: f64,
        unrealized_pnl: f64,
        long_current_price: f64,
        long_unrealized_pnl: f64,
        short_current_price: f64,
        short_unrealized_pnl: f64,
    ) {
        let mut runtime = self.runtime.lock();
        runtime.current_spread = current_spread;
        runtime.unrealized_pnl = unrealized_pnl;
        runtime.last_update = Instant::now();
        if runtime.legs.len() == 2 {
            runtime.legs[0].current_price = long_current_price;
            runtime.legs[0].unrealized_pnl = long_unrealized_pnl;
            runtime.legs[1].current_price = short_current_price;
            runtime.legs[1].unrealized_pnl = short_unrealized_pnl;
        }
    }

    pub fn legs(&self) -> Vec<Leg> {
        self.runtime.lock().legs.clone()
    }
}
