//! Cross-module scenarios exercising the engine end to end: the six
//! situations a pair actually lives through (entry, both kinds of "can't
//! enter right now", second-leg rollback, stop-loss, liquidation, and a
//! degrading partial entry). Each test wires real components together
//! rather than mocking collaborators, the way the teacher crate's
//! `tests/` integration suite drives `vault`/`edge` end to end against
//! `PaperExecutionAdapter`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use perp_arb_engine::config::{EngineConfig, FeeTable};
use perp_arb_engine::executor;
use perp_arb_engine::metrics::Metrics;
use perp_arb_engine::notify::{NotificationBus, Severity};
use perp_arb_engine::pair::{PairConfig, PairHandle, PairState, PairStatus};
use perp_arb_engine::risk::RiskMonitor;
use perp_arb_engine::rollback::RollbackHandler;
use perp_arb_engine::venue::{
    LiquidationEvent, PaperVenueAdapter, PaperVenueAdapterConfig, PositionSide, VenueAdapter,
};
use perp_arb_engine::{Engine, Leg};

fn paper_adapters(long_mark: f64, short_mark: f64) -> HashMap<String, Arc<dyn VenueAdapter>> {
    let long = PaperVenueAdapter::new("binance", PaperVenueAdapterConfig::default());
    long.set_mark_price(long_mark);
    let short = PaperVenueAdapter::new("okx", PaperVenueAdapterConfig::default());
    short.set_mark_price(short_mark);
    let mut m: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    m.insert("binance".to_string(), Arc::new(long));
    m.insert("okx".to_string(), Arc::new(short));
    m
}

fn base_pair_config(id: &str) -> PairConfig {
    PairConfig {
        id: id.to_string(),
        symbol: "BTCUSDT".to_string(),
        entry_spread_pct: 0.05,
        exit_spread_pct: 0.01,
        volume_asset: 0.1,
        n_orders: 1,
        stop_loss: 100.0,
        status: PairStatus::Active,
    }
}

// 1. Entry happy path: reject at a thin spread, accept once the quotes
// widen past the pair's entry threshold.
#[tokio::test]
async fn entry_happy_path_rejects_then_accepts() {
    let adapters = paper_adapters(50_000.0, 50_002.0);
    let engine = Engine::new(EngineConfig::default(), vec![base_pair_config("pair-1")], adapters);
    let pair = engine.pair("pair-1").unwrap();
    pair.try_transition(PairState::Ready).unwrap();

    // Net spread ~0.02%, below the 0.05% threshold -> rejected, pair re-armed.
    engine.aggregator.apply_update("binance", "BTCUSDT", 49990.0, 50000.0, 1);
    engine.aggregator.apply_update("okx", "BTCUSDT", 50010.0, 50012.0, 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first = engine.try_enter("pair-1").await;
    assert!(first.is_some());
    assert_eq!(pair.state(), PairState::Ready, "rejection must leave the pair re-armed");

    // Raise okx's bid so net spread clears the threshold comfortably.
    engine.aggregator.apply_update("okx", "BTCUSDT", 50200.0, 50220.0, 3);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = engine.try_enter("pair-1").await;
    assert!(matches!(second, Some(Ok(()))));
    assert_eq!(pair.state(), PairState::Holding);
}

// 2. A paused pair and an already-Holding pair both refuse to be claimed
// for entry — entry gating starts at the state machine, before the
// evaluator ever runs.
#[tokio::test]
async fn inactive_or_open_pair_blocks_entry() {
    let adapters = paper_adapters(50_000.0, 50_200.0);
    let mut paused_cfg = base_pair_config("paused-pair");
    paused_cfg.status = PairStatus::Paused;
    let holding_cfg = base_pair_config("holding-pair");

    let engine = Engine::new(EngineConfig::default(), vec![paused_cfg, holding_cfg], adapters);
    engine.aggregator.apply_update("binance", "BTCUSDT", 49990.0, 50000.0, 1);
    engine.aggregator.apply_update("okx", "BTCUSDT", 50200.0, 50220.0, 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // paused-pair never transitions to Ready, so its is_ready flag is never set.
    let paused = engine.pair("paused-pair").unwrap();
    assert_eq!(paused.state(), PairState::Paused);
    assert!(engine.try_enter("paused-pair").await.is_none());

    // holding-pair is already holding a position; claim must fail too.
    let holding = engine.pair("holding-pair").unwrap();
    holding.try_transition(PairState::Ready).unwrap();
    assert!(holding.try_claim_for_entry());
    holding
        .enter_with_legs([
            Leg {
                venue: "binance".to_string(),
                side: PositionSide::Long,
                entry_price: 50_000.0,
                current_price: 50_000.0,
                quantity: 0.1,
                unrealized_pnl: 0.0,
            },
            Leg {
                venue: "okx".to_string(),
                side: PositionSide::Short,
                entry_price: 50_200.0,
                current_price: 50_200.0,
                quantity: 0.1,
                unrealized_pnl: 0.0,
            },
        ], 1)
        .unwrap();
    assert_eq!(holding.state(), PairState::Holding);
    assert!(engine.try_enter("holding-pair").await.is_none());
}

// 3. One leg fills, the other errors: the surviving leg is rolled back and
// the executor reports SecondLegFailed, with a warn-severity notification.
#[tokio::test]
async fn rollback_on_second_leg_failure() {
    let long = PaperVenueAdapter::new("binance", PaperVenueAdapterConfig::default());
    long.set_mark_price(50_010.0);
    // okx has no mark price configured -> place_market_order fails permanently.
    let short = PaperVenueAdapter::new("okx", PaperVenueAdapterConfig::default());
    let mut adapters: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert("binance".to_string(), Arc::new(long));
    adapters.insert("okx".to_string(), Arc::new(short));

    let bus = Arc::new(NotificationBus::new(8));
    let mut rx = bus.subscribe();
    let rollback = RollbackHandler::new(Duration::from_secs(5), 1, Duration::from_millis(10), bus);
    let metrics = Metrics::new();

    let result = executor::execute_parallel(
        &adapters,
        "pair-1",
        "BTCUSDT",
        0.1,
        "binance",
        "okx",
        Duration::from_secs(5),
        &rollback,
        &metrics,
    )
    .await;

    match result {
        Err(perp_arb_engine::ExecutionError::SecondLegFailed { failed_side, rolled_back_side, .. }) => {
            assert_eq!(failed_side, "short");
            assert_eq!(rolled_back_side, "long");
        }
        other => panic!("expected SecondLegFailed, got {other:?}"),
    }

    let notification = rx.try_recv().expect("rollback must always notify");
    assert_eq!(notification.severity, Severity::Warn);
    assert_eq!(notification.meta.get("rollback_succeeded").unwrap(), true);
}

// 4. A Holding pair whose unrealized loss breaches stop_loss gets closed
// and pauses for manual review.
#[tokio::test]
async fn stop_loss_closes_and_pauses_pair() {
    // legs: long@34 on A, short@36 on B, qty 10. Live bid_A=30, ask_B=38 ->
    // unrealized_pnl = (30-34)*10 + (36-38)*10 = -60, which breaches stop_loss=50.
    let pair = Arc::new(PairHandle::new(PairConfig {
        id: "pair-1".to_string(),
        symbol: "BTCUSDT".to_string(),
        entry_spread_pct: 0.1,
        exit_spread_pct: 0.01,
        volume_asset: 10.0,
        n_orders: 1,
        stop_loss: 50.0,
        status: PairStatus::Active,
    }));
    pair.try_transition(PairState::Ready).unwrap();
    pair.try_claim_for_entry();
    pair.enter_with_legs([
        Leg {
            venue: "venue-a".to_string(),
            side: PositionSide::Long,
            entry_price: 34.0,
            current_price: 34.0,
            quantity: 10.0,
            unrealized_pnl: 0.0,
        },
        Leg {
            venue: "venue-b".to_string(),
            side: PositionSide::Short,
            entry_price: 36.0,
            current_price: 36.0,
            quantity: 10.0,
            unrealized_pnl: 0.0,
        },
    ], 1)
    .unwrap();

    let aggregator = Arc::new(perp_arb_engine::quotes::QuoteAggregator::new(2, 1, 1000, Arc::new(Metrics::new())));
    aggregator.apply_update("venue-a", "BTCUSDT", 30.0, 30.5, 1);
    aggregator.apply_update("venue-b", "BTCUSDT", 38.0, 38.5, 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let adapter_a = PaperVenueAdapter::new("venue-a", PaperVenueAdapterConfig::default());
    adapter_a.set_mark_price(30.0);
    let adapter_b = PaperVenueAdapter::new("venue-b", PaperVenueAdapterConfig::default());
    adapter_b.set_mark_price(38.0);
    let mut adapters: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert("venue-a".to_string(), Arc::new(adapter_a));
    adapters.insert("venue-b".to_string(), Arc::new(adapter_b));

    let monitor = RiskMonitor::new(
        vec![pair.clone()],
        aggregator,
        Arc::new(RwLock::new(FeeTable::new())),
        0.0,
        Arc::new(adapters),
        Arc::new(NotificationBus::new(8)),
        Arc::new(Metrics::new()),
        Duration::from_secs(5),
        Duration::from_millis(500),
        3,
        Duration::from_millis(10),
    );

    monitor.tick().await;
    assert_eq!(pair.state(), PairState::Paused);
}

// 5. Liquidation on one venue forces the surviving leg closed via the
// aggressive emergency-retry path, with a critical notification either way.
#[tokio::test]
async fn liquidation_emergency_closes_surviving_leg_and_notifies() {
    let pair = Arc::new(PairHandle::new(PairConfig {
        id: "pair-1".to_string(),
        symbol: "BTCUSDT".to_string(),
        entry_spread_pct: 0.1,
        // Both auto-close paths disabled so only the liquidation path can act.
        exit_spread_pct: -1000.0,
        volume_asset: 0.1,
        n_orders: 1,
        stop_loss: 1_000_000.0,
        status: PairStatus::Active,
    }));
    pair.try_transition(PairState::Ready).unwrap();
    pair.try_claim_for_entry();
    pair.enter_with_legs([
        Leg {
            venue: "binance".to_string(),
            side: PositionSide::Long,
            entry_price: 50_000.0,
            current_price: 50_000.0,
            quantity: 0.1,
            unrealized_pnl: 0.0,
        },
        Leg {
            venue: "okx".to_string(),
            side: PositionSide::Short,
            entry_price: 50_100.0,
            current_price: 50_100.0,
            quantity: 0.1,
            unrealized_pnl: 0.0,
        },
    ], 1)
    .unwrap();

    let aggregator = Arc::new(perp_arb_engine::quotes::QuoteAggregator::new(2, 1, 1000, Arc::new(Metrics::new())));
    let surviving = PaperVenueAdapter::new("okx", PaperVenueAdapterConfig::default());
    surviving.set_mark_price(50_100.0);
    let liquidated = PaperVenueAdapter::new("binance", PaperVenueAdapterConfig::default());
    let mut adapters: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert("binance".to_string(), Arc::new(liquidated));
    adapters.insert("okx".to_string(), Arc::new(surviving));

    let bus = Arc::new(NotificationBus::new(8));
    let mut rx = bus.subscribe();
    let monitor = RiskMonitor::new(
        vec![pair.clone()],
        aggregator,
        Arc::new(RwLock::new(FeeTable::new())),
        0.0005,
        Arc::new(adapters),
        bus,
        Arc::new(Metrics::new()),
        Duration::from_secs(5),
        Duration::from_millis(500),
        3,
        Duration::from_millis(5),
    );

    monitor
        .handle_liquidation(LiquidationEvent {
            venue: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            liquidated: true,
        })
        .await;

    assert_eq!(pair.state(), PairState::Paused);
    let notification = rx.try_recv().expect("liquidation always notifies");
    assert_eq!(notification.severity, Severity::Critical);
}

// 6. A 3-order partial entry fills its first part, then aborts when the
// re-checked spread has degraded below the softened threshold.
#[tokio::test]
async fn partial_entry_stops_early_on_spread_degradation() {
    let adapters = paper_adapters(50_000.0, 50_200.0);
    let rollback = RollbackHandler::new(Duration::from_secs(5), 1, Duration::from_millis(10), Arc::new(NotificationBus::new(8)));
    let metrics = Metrics::new();

    // entry_spread_pct=0.04, softening_factor=0.8 -> viability floor is 0.032.
    // First sub-entry fills at the live 0.25%-ish spread; the recheck before
    // the second sub-entry reports 0.03%, which is below the floor.
    let mut checks = 0;
    let result = executor::execute_partial_entry(
        &adapters,
        "pair-1",
        "BTCUSDT",
        0.3,
        3,
        "binance",
        "okx",
        0.04,
        0.8,
        Duration::from_secs(5),
        &rollback,
        &metrics,
        || {
            checks += 1;
            Some(0.03)
        },
    )
    .await
    .expect("first sub-entry should have filled");

    assert_eq!(result.filled_parts, 1);
    assert!((result.legs[0].quantity - 0.1).abs() < 1e-9, "only the first part's volume should have filled");
    assert_eq!(checks, 1, "recheck only runs before sub-entries after the first");
}
