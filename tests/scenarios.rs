// End-to-end scenario tests driving the real trading loop, risk ledger, and
// signal engine together, with a stub exchange client standing in for the
// network. Each test mirrors one of the literal scenarios the trading logic
// was built against.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use scalp_engine::app_state::AppState;
use scalp_engine::book::TradingBook;
use scalp_engine::config::Config;
use scalp_engine::exchange::Exchange;
use scalp_engine::trading_loop;
use scalp_engine::types::{Tick, TradingMode};

use common::StubExchangeClient;

fn harness(config: Config, starting_balance: f64) -> (Arc<AppState>, Arc<StubExchangeClient>) {
    let config = Arc::new(config);
    let book = Arc::new(TradingBook::new(
        starting_balance,
        config.max_positions,
        config.max_daily_loss,
        config.stop_loss_pct,
        config.take_profit_pct,
        config.max_hold_seconds,
    ));
    let stub = Arc::new(StubExchangeClient::new(starting_balance));
    let exchange: Arc<dyn Exchange> = stub.clone();
    let state = Arc::new(AppState::new(config, book, exchange));
    state.set_trading_mode(TradingMode::Live);
    state.set_connected(true);
    (state, stub)
}

fn tick(symbol: &str, price: f64, volume: f64, change_24h: f64) -> Tick {
    Tick {
        symbol: symbol.to_string(),
        price,
        volume,
        bid: price - 0.01,
        ask: price + 0.01,
        change_24h,
        timestamp: Instant::now(),
    }
}

/// Feed a rising-momentum burst: 20 ticks up 0.05% each with elevated volume
/// and a positive 24h change, matching the S1 fixture.
async fn feed_momentum_burst(senders: &std::collections::HashMap<String, tokio::sync::mpsc::Sender<Tick>>, symbol: &str, start: f64) -> f64 {
    let mut price = start;
    for _ in 0..20 {
        price *= 1.0005;
        senders.get(symbol).unwrap().send(tick(symbol, price, 150.0, 0.03)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    price
}

#[tokio::test]
async fn s1_momentum_long_fill() {
    let mut config = Config::default();
    config.symbols = vec!["BTCUSDT".into()];
    config.position_size_usd = 100.0;
    config.stop_loss_pct = 0.002;
    config.take_profit_pct = 0.006;
    config.min_signal_strength = 0.55;

    let (state, stub) = harness(config, 1000.0);
    let senders = trading_loop::spawn_symbol_workers(state.clone(), &state.config.symbols.clone());

    let entry = 30000.0 * 1.0005f64.powi(20);
    stub.set_fill_price(entry);
    feed_momentum_burst(&senders, "BTCUSDT", 30000.0).await;

    let signals = state.recent_signals.read();
    assert!(!signals.is_empty(), "expected at least one emitted signal");
    assert!(signals.iter().any(|s| s.strength >= 0.85), "expected a high-strength BUY signal");
    drop(signals);

    let positions = state.book.open_positions();
    assert_eq!(positions.len(), 1);
    let pos = &positions[0];
    assert!((pos.entry_price - entry).abs() / entry < 0.001);
    assert!((pos.stop_loss_price - entry * 0.998).abs() / entry < 0.001);
    assert!((pos.take_profit_price - entry * 1.006).abs() / entry < 0.001);
}

#[tokio::test]
async fn s2_take_profit_exit() {
    let mut config = Config::default();
    config.symbols = vec!["BTCUSDT".into()];
    config.position_size_usd = 100.0;

    let (state, stub) = harness(config, 1000.0);
    let senders = trading_loop::spawn_symbol_workers(state.clone(), &state.config.symbols.clone());

    let entry = feed_momentum_burst(&senders, "BTCUSDT", 30000.0).await;
    stub.set_fill_price(entry);
    // Drive the momentum signal to a fill by re-sending the final tick once
    // the fill price has been primed.
    senders.get("BTCUSDT").unwrap().send(tick("BTCUSDT", entry, 150.0, 0.03)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.book.open_positions().len(), 1);

    let exit_price = entry * 1.0065;
    stub.set_fill_price(exit_price);
    senders.get("BTCUSDT").unwrap().send(tick("BTCUSDT", exit_price, 150.0, 0.03)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sweep_task = tokio::spawn(trading_loop::run_sweep_loop(state.clone()));
    tokio::time::sleep(Duration::from_millis(2200)).await;
    sweep_task.abort();

    assert!(state.book.open_positions().is_empty(), "position should have closed on take-profit");
    let trades = state.book.recent_closed_trades(10);
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, scalp_engine::types::ExitReason::TakeProfit);
    let expected_pnl = 0.0065 * entry * trades[0].quantity;
    assert!((trades[0].realized_pnl - expected_pnl).abs() / expected_pnl < 0.02);
    assert_eq!(state.book.risk_snapshot().winning_trades, 1);
}

#[tokio::test]
async fn s3_stop_loss_exit() {
    let mut config = Config::default();
    config.symbols = vec!["BTCUSDT".into()];
    config.position_size_usd = 100.0;

    let (state, stub) = harness(config, 1000.0);
    let senders = trading_loop::spawn_symbol_workers(state.clone(), &state.config.symbols.clone());

    let entry = feed_momentum_burst(&senders, "BTCUSDT", 30000.0).await;
    stub.set_fill_price(entry);
    senders.get("BTCUSDT").unwrap().send(tick("BTCUSDT", entry, 150.0, 0.03)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.book.open_positions().len(), 1);

    let exit_price = entry * 0.9975;
    stub.set_fill_price(exit_price);
    senders.get("BTCUSDT").unwrap().send(tick("BTCUSDT", exit_price, 150.0, 0.03)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sweep_task = tokio::spawn(trading_loop::run_sweep_loop(state.clone()));
    tokio::time::sleep(Duration::from_millis(2200)).await;
    sweep_task.abort();

    assert!(state.book.open_positions().is_empty());
    let trades = state.book.recent_closed_trades(10);
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, scalp_engine::types::ExitReason::StopLoss);
    assert!(trades[0].realized_pnl < 0.0);
}

#[tokio::test]
async fn s4_cooldown_suppresses_second_signal() {
    let mut config = Config::default();
    config.symbols = vec!["BTCUSDT".into()];
    config.min_signal_interval_seconds = 10;
    config.max_positions = 1;

    let (state, stub) = harness(config, 1000.0);
    let senders = trading_loop::spawn_symbol_workers(state.clone(), &state.config.symbols.clone());

    stub.set_fill_price(30100.0);
    feed_momentum_burst(&senders, "BTCUSDT", 30000.0).await;
    let after_first = state.recent_signals.read().len();
    assert_eq!(after_first, 1);

    // Second qualifying burst arrives ~3 s later, inside the 10 s cooldown —
    // constructed via a backdated Instant rather than a real sleep so the
    // test runs at full speed.
    let backdated = Instant::now().checked_sub(Duration::from_secs(7)).unwrap();
    let mut price = 30100.0 * 1.0005f64.powi(20);
    for _ in 0..20 {
        price *= 1.0005;
        let mut t = tick("BTCUSDT", price, 150.0, 0.03);
        t.timestamp = backdated;
        senders.get("BTCUSDT").unwrap().send(t).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(state.recent_signals.read().len(), 1, "cooldown should suppress the second burst");
}

#[tokio::test]
async fn s5_risk_veto_on_max_positions() {
    let mut config = Config::default();
    config.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    config.max_positions = 1;
    config.position_size_usd = 100.0;

    let (state, stub) = harness(config, 1000.0);
    let senders = trading_loop::spawn_symbol_workers(state.clone(), &state.config.symbols.clone());

    stub.set_fill_price(30100.0);
    feed_momentum_burst(&senders, "BTCUSDT", 30000.0).await;
    assert_eq!(state.book.open_positions().len(), 1);

    stub.set_fill_price(2000.0);
    feed_momentum_burst(&senders, "ETHUSDT", 1900.0).await;

    // Admission was denied, so no second position and no order placed for ETHUSDT.
    let positions = state.book.open_positions();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].symbol, "BTCUSDT");
    assert!(stub.orders.lock().iter().all(|o| o.symbol != "ETHUSDT"));

    // The signal itself is still recorded in history even though it was vetoed.
    assert!(state.recent_signals.read().iter().any(|s| s.symbol == "ETHUSDT"));
}

#[tokio::test]
async fn s6_percent_price_rejection_does_not_open_and_does_not_block_next_symbol() {
    let mut config = Config::default();
    config.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    config.position_size_usd = 100.0;

    let (state, stub) = harness(config, 1000.0);
    let senders = trading_loop::spawn_symbol_workers(state.clone(), &state.config.symbols.clone());

    let balance_before = state.book.risk_snapshot().current_balance;
    stub.reject_next_with_percent_price();
    feed_momentum_burst(&senders, "BTCUSDT", 30000.0).await;

    assert!(state.book.open_positions().is_empty());
    assert_eq!(state.book.risk_snapshot().current_balance, balance_before);

    // A fresh qualifying signal on a different symbol proceeds normally.
    stub.set_fill_price(2000.0);
    feed_momentum_burst(&senders, "ETHUSDT", 1900.0).await;
    let positions = state.book.open_positions();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].symbol, "ETHUSDT");
}

#[tokio::test]
async fn s7_daily_loss_halt_blocks_new_entries_but_not_sweep_closes() {
    let mut config = Config::default();
    config.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    config.position_size_usd = 100.0;
    // A tiny daily-loss ceiling so a single stop-loss exit breaches it.
    config.max_daily_loss = 0.05;

    let (state, stub) = harness(config, 1000.0);
    let senders = trading_loop::spawn_symbol_workers(state.clone(), &state.config.symbols.clone());

    let entry = feed_momentum_burst(&senders, "BTCUSDT", 30000.0).await;
    stub.set_fill_price(entry);
    senders.get("BTCUSDT").unwrap().send(tick("BTCUSDT", entry, 150.0, 0.03)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.book.open_positions().len(), 1);

    // Open a second position on ETHUSDT so there's something for the sweep
    // to close after the daily loss breach.
    stub.set_fill_price(2000.0);
    feed_momentum_burst(&senders, "ETHUSDT", 1900.0).await;
    assert_eq!(state.book.open_positions().len(), 2);

    // Drive BTCUSDT to a stop-loss so the ledger breaches max_daily_loss.
    let exit_price = entry * 0.9975;
    stub.set_fill_price(exit_price);
    senders.get("BTCUSDT").unwrap().send(tick("BTCUSDT", exit_price, 150.0, 0.03)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sweep_task = tokio::spawn(trading_loop::run_sweep_loop(state.clone()));
    tokio::time::sleep(Duration::from_millis(2200)).await;

    assert!(state.book.risk_snapshot().daily_pnl <= -0.05, "daily loss should have breached the ceiling");
    assert!(state.book.open_positions().iter().all(|p| p.symbol != "BTCUSDT"), "BTCUSDT should have closed on stop-loss");

    // New qualifying signal on a third symbol must be rejected at admission.
    stub.set_fill_price(100.0);
    feed_momentum_burst(&senders, "BTCUSDT", 29000.0).await;
    assert!(state.book.open_positions().iter().all(|p| p.symbol != "BTCUSDT"), "admission must reject new entries while daily loss is breached");

    sweep_task.abort();
}
