// =============================================================================
// Trading Loop — per-symbol tick processing and the periodic sweep
// =============================================================================
//
// Each configured symbol gets its own task owning a `SymbolState` and an
// inbound tick channel, so processing for a symbol is strictly serialized
// (state update -> position mark -> signal emission -> order placement)
// without per-tick locking. A separate sweep task runs every 2 s against the
// shared `TradingBook` to guarantee closes even when a symbol goes silent.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::exchange::client::OrderOutcome;
use crate::signal_engine;
use crate::symbol_state::SymbolState;
use crate::types::{Direction, ExitReason, Tick, TradingMode};

const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const TICK_CHANNEL_CAPACITY: usize = 256;

/// Create the per-symbol tick channels the stream client will be given, and
/// spawn a worker task for each one. Returns the sender half keyed by symbol.
pub fn spawn_symbol_workers(
    state: Arc<AppState>,
    symbols: &[String],
) -> std::collections::HashMap<String, mpsc::Sender<Tick>> {
    let mut senders = std::collections::HashMap::new();
    for symbol in symbols {
        let (tx, rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        senders.insert(symbol.clone(), tx);
        let state = state.clone();
        let symbol = symbol.clone();
        tokio::spawn(async move {
            run_symbol_worker(state, symbol, rx).await;
        });
    }
    senders
}

async fn run_symbol_worker(state: Arc<AppState>, symbol: String, mut rx: mpsc::Receiver<Tick>) {
    let mut symbol_state = SymbolState::new(symbol.clone());

    while let Some(tick) = rx.recv().await {
        handle_tick(&state, &mut symbol_state, tick).await;
    }

    warn!(symbol, "tick channel closed, worker exiting");
}

async fn handle_tick(state: &Arc<AppState>, symbol_state: &mut SymbolState, tick: Tick) {
    symbol_state.push(tick.price, tick.volume, tick.change_24h, tick.timestamp);
    state.book.on_tick(&tick.symbol, tick.price);

    if *state.trading_mode.read() != TradingMode::Live {
        return;
    }

    let Some(signal) = signal_engine::evaluate(symbol_state, None) else {
        return;
    };

    if signal.strength < state.config.min_signal_strength {
        return;
    }
    if let Some(last) = symbol_state.last_signal_timestamp {
        if tick.timestamp.duration_since(last) < Duration::from_secs(state.config.min_signal_interval_seconds) {
            return;
        }
    }

    symbol_state.last_signal_timestamp = Some(tick.timestamp);
    state.push_signal(signal.clone());

    try_open_position(state, &tick.symbol, signal.direction, tick.price, tick.timestamp).await;
}

async fn try_open_position(state: &Arc<AppState>, symbol: &str, direction: Direction, price: f64, now: Instant) {
    let balance = state.book.risk_snapshot().current_balance;
    let connected = *state.connected.read();
    let position_size_usd = state.effective_position_size_usd(symbol);

    if let Err(reason) = state.book.can_open_position(symbol, balance, position_size_usd, connected) {
        info!(symbol, %reason, "signal rejected at admission");
        return;
    }

    let side = match direction {
        Direction::Buy => "BUY",
        Direction::Sell => "SELL",
    };
    let quantity = position_size_usd / price;

    match state.exchange.place_market_order(symbol, side, quantity).await {
        OrderOutcome::Filled(fill) => {
            state.book.open(symbol, direction, fill.fill_price, fill.quantity, now);
            state.increment_version();
        }
        OrderOutcome::Skipped(filter) => {
            info!(symbol, filter, "order skipped by exchange filter");
        }
        OrderOutcome::Failed(reason) => {
            warn!(symbol, %reason, "order failed");
            if reason.contains("LOT_SIZE") || reason.contains("MIN_NOTIONAL") {
                state.step_down_position_size_ladder(symbol);
            }
            state.push_error(format!("order failed for {symbol}: {reason}"), None);
        }
    }
}

/// Runs forever: every `SWEEP_INTERVAL`, evaluate every open position's exit
/// conditions and issue closes.
pub async fn run_sweep_loop(state: Arc<AppState>) -> ! {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        sweep_once(&state).await;
    }
}

async fn sweep_once(state: &Arc<AppState>) {
    let now = Instant::now();
    let to_close = state.book.positions_to_close(now);

    for (symbol, reason) in to_close {
        close_position(state, &symbol, reason).await;
    }
}

async fn close_position(state: &Arc<AppState>, symbol: &str, reason: ExitReason) {
    let positions = state.book.open_positions();
    let Some(position) = positions.into_iter().find(|p| p.symbol == symbol) else {
        return;
    };

    let closing_side = position.side.closing_order_side();

    match state.exchange.place_market_order(symbol, closing_side, position.quantity).await {
        OrderOutcome::Filled(fill) => {
            state.book.close(symbol, fill.fill_price, reason);
            state.increment_version();
        }
        OrderOutcome::Skipped(_) | OrderOutcome::Failed(_) => {
            if reason == ExitReason::Emergency {
                state.book.force_delete(symbol);
                state.push_error(format!("emergency close failed for {symbol}, forced local delete"), None);
            } else {
                warn!(symbol, %reason, "close failed at exchange, will retry next sweep");
            }
        }
    }
}

/// Issue emergency closes for every open position, awaiting up to
/// `ceiling` before returning regardless of outcome. Used during shutdown.
pub async fn emergency_close_all(state: Arc<AppState>, ceiling: Duration) {
    let positions = state.book.open_positions();
    if positions.is_empty() {
        return;
    }

    info!(count = positions.len(), "issuing emergency closes on shutdown");
    let closes = positions.into_iter().map(|p| {
        let state = state.clone();
        async move {
            close_position(&state, &p.symbol, ExitReason::Emergency).await;
        }
    });

    let _ = tokio::time::timeout(ceiling, futures_util::future::join_all(closes)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::TradingBook;
    use crate::config::Config;
    use crate::exchange::{Exchange, ExchangeClient};

    fn app_state() -> Arc<AppState> {
        let config = Arc::new(Config::default());
        let book = Arc::new(TradingBook::new(1000.0, 3, 25.0, 0.002, 0.006, 300));
        let exchange: Arc<dyn Exchange> = Arc::new(ExchangeClient::new("k", "s", config.rest_base_url()));
        Arc::new(AppState::new(config, book, exchange))
    }

    /// Always rejects with a LOT_SIZE filter violation, for exercising the
    /// position-size ladder without reaching the network.
    struct LotSizeRejectingExchange;

    #[async_trait::async_trait]
    impl Exchange for LotSizeRejectingExchange {
        async fn get_server_time(&self) -> anyhow::Result<i64> {
            Ok(0)
        }
        async fn get_balance(&self) -> anyhow::Result<f64> {
            Ok(1000.0)
        }
        async fn place_market_order(&self, _symbol: &str, _side: &str, _quantity: f64) -> OrderOutcome {
            OrderOutcome::Failed("Filter failure: LOT_SIZE".to_string())
        }
    }

    fn app_state_with_lot_size_rejections() -> Arc<AppState> {
        let config = Arc::new(Config::default());
        let book = Arc::new(TradingBook::new(1000.0, 3, 25.0, 0.002, 0.006, 300));
        let exchange: Arc<dyn Exchange> = Arc::new(LotSizeRejectingExchange);
        Arc::new(AppState::new(config, book, exchange))
    }

    #[tokio::test]
    async fn lot_size_rejection_steps_down_position_size_ladder() {
        let state = app_state_with_lot_size_rejections();
        state.set_connected(true);
        let base = state.config.position_size_usd;

        try_open_position(&state, "BTCUSDT", Direction::Buy, 100.0, Instant::now()).await;
        assert!(state.effective_position_size_usd("BTCUSDT") < base);
        assert!(state.book.open_positions().is_empty());

        let after_one = state.effective_position_size_usd("BTCUSDT");
        try_open_position(&state, "BTCUSDT", Direction::Buy, 100.0, Instant::now()).await;
        assert!(state.effective_position_size_usd("BTCUSDT") < after_one);

        // A different symbol is unaffected.
        assert!((state.effective_position_size_usd("ETHUSDT") - base).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn tick_handling_updates_mark_for_open_position() {
        let state = app_state();
        state.book.open("BTCUSDT", Direction::Buy, 100.0, 1.0, Instant::now());
        let mut symbol_state = SymbolState::new("BTCUSDT");

        let tick = Tick {
            symbol: "BTCUSDT".into(),
            price: 105.0,
            volume: 10.0,
            bid: 104.9,
            ask: 105.1,
            change_24h: 0.01,
            timestamp: Instant::now(),
        };
        handle_tick(&state, &mut symbol_state, tick).await;

        let positions = state.book.open_positions();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].unrealized_pnl - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn paused_mode_never_emits_new_positions() {
        let state = app_state();
        state.set_trading_mode(TradingMode::Paused);
        let mut symbol_state = SymbolState::new("BTCUSDT");

        for p in [100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 130.0] {
            let tick = Tick {
                symbol: "BTCUSDT".into(),
                price: p,
                volume: 50.0,
                bid: p - 0.1,
                ask: p + 0.1,
                change_24h: 0.05,
                timestamp: Instant::now(),
            };
            handle_tick(&state, &mut symbol_state, tick).await;
        }

        assert!(state.book.open_positions().is_empty());
    }
}
