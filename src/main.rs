//! Demo entry point: wires a small `Engine` against `PaperVenueAdapter`s and
//! runs the scan/enter loop, mirroring how the teacher's `main.rs` loads env,
//! initializes tracing, builds its `AppState`, and spawns background tasks —
//! scaled down to this crate's scan-loop shape instead of an HTTP API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use perp_arb_engine::config::EngineConfig;
use perp_arb_engine::pair::{PairConfig, PairState, PairStatus};
use perp_arb_engine::venue::{PaperVenueAdapter, PaperVenueAdapterConfig, VenueAdapter};
use perp_arb_engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    info!("perp-arb-engine starting");

    let config = EngineConfig::from_env();
    let adapters = demo_adapters();
    let pairs = demo_pairs();

    let engine = Engine::new(config, pairs, adapters);
    for pair in &engine.pairs {
        if pair.config.read().status != PairStatus::Active {
            continue;
        }
        if let Err(fault) = pair.try_transition(PairState::Ready) {
            warn!(pair_id = pair.id(), %fault, "pair failed to arm at startup");
        }
    }

    engine.spawn_risk_monitor();
    info!("risk monitor running, entering scan loop");

    let mut ticks = tokio::time::interval(Duration::from_millis(250));
    loop {
        ticks.tick().await;

        for (pair_id, verdict) in engine.scan_for_entries().await {
            match verdict {
                Ok(_) => match engine.try_enter(&pair_id).await {
                    Some(Ok(())) => info!(pair_id, "entry attempt completed"),
                    Some(Err(e)) => warn!(pair_id, %e, "entry attempt failed"),
                    None => {}
                },
                Err(reason) => {
                    tracing::debug!(pair_id, %reason, "entry rejected");
                }
            }
        }
    }
}

/// Two paper venues standing in for real exchange adapters. A production
/// deployment would construct REST/websocket-backed `VenueAdapter` impls here
/// instead, keyed by the same venue names used in `PairConfig`.
fn demo_adapters() -> HashMap<String, Arc<dyn VenueAdapter>> {
    let binance = PaperVenueAdapter::new("binance", PaperVenueAdapterConfig::default());
    binance.set_mark_price(50_000.0);
    let okx = PaperVenueAdapter::new("okx", PaperVenueAdapterConfig::default());
    okx.set_mark_price(50_010.0);

    let mut adapters: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert("binance".to_string(), Arc::new(binance));
    adapters.insert("okx".to_string(), Arc::new(okx));
    adapters
}

fn demo_pairs() -> Vec<PairConfig> {
    vec![PairConfig {
        id: "btc-binance-okx".to_string(),
        symbol: "BTCUSDT".to_string(),
        entry_spread_pct: 0.05,
        exit_spread_pct: 0.01,
        volume_asset: 0.1,
        n_orders: 1,
        stop_loss: 500.0,
        status: PairStatus::Active,
    }]
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perp_arb_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();
}
