// =============================================================================
// Scalp Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Paused mode for safety. Operators must explicitly
// switch to Live mode via the dashboard control endpoints.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scalp_engine::app_state::AppState;
use scalp_engine::book::TradingBook;
use scalp_engine::config::Config;
use scalp_engine::exchange::{Exchange, ExchangeClient};
use scalp_engine::stream::StreamClient;
use scalp_engine::trading_loop;

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_CLOSE_CEILING: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Scalp Engine — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Arc::new(Config::from_env(RUNTIME_CONFIG_PATH));

    info!(
        symbols = ?config.symbols,
        use_testnet = config.use_testnet,
        trading_mode = %config.trading_mode,
        "engine starting in SAFE mode (Paused until resumed)"
    );

    // ── 2. Exchange client ────────────────────────────────────────────────
    let exchange: Arc<dyn Exchange> = Arc::new(ExchangeClient::new(
        config.api_key.clone(),
        config.api_secret.clone(),
        config.rest_base_url(),
    ));

    let starting_balance = match exchange.get_balance().await {
        Ok(balance) => balance,
        Err(e) => {
            warn!(error = %e, "failed to fetch starting balance, defaulting to 0");
            0.0
        }
    };

    // ── 3. Shared state ────────────────────────────────────────────────────
    let book = Arc::new(TradingBook::new(
        starting_balance,
        config.max_positions,
        config.max_daily_loss,
        config.stop_loss_pct,
        config.take_profit_pct,
        config.max_hold_seconds,
    ));

    let state = Arc::new(AppState::new(config.clone(), book, exchange));
    state.set_trading_mode(config.trading_mode);

    // ── 4. Market data ─────────────────────────────────────────────────────
    let senders = trading_loop::spawn_symbol_workers(state.clone(), &config.symbols);

    let stream_client = Arc::new(StreamClient::new(config.stream_base_url(), config.symbols.clone()));
    {
        let stream_client = stream_client.clone();
        let state = state.clone();
        tokio::spawn(async move {
            stream_client.run(senders, state).await;
        });
    }

    // ── 5. Position sweep ──────────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            trading_loop::run_sweep_loop(state).await;
        });
    }

    // ── 6. Snapshot broadcast (1 Hz, independent of any connected observer) ─
    {
        let state = state.clone();
        let stream_client = stream_client.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tick.tick().await;
                state.publish_snapshot(stream_client.connection_generation());
            }
        });
    }

    // ── 7. Dashboard API server ────────────────────────────────────────────
    let bind_addr = format!("0.0.0.0:{}", config.dashboard_port);
    {
        let api_state = state.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = scalp_engine::api::rest::router(api_state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind dashboard API server");
            info!(addr = %bind_addr, "dashboard API listening");
            axum::serve(listener, app).await.expect("dashboard API server failed");
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 8. Graceful shutdown ────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    state.set_trading_mode(scalp_engine::types::TradingMode::Killed);
    trading_loop::emergency_close_all(state.clone(), SHUTDOWN_CLOSE_CEILING).await;

    if let Err(e) = config.save(RUNTIME_CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("scalp engine shut down complete");
    Ok(())
}
