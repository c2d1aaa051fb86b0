// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth shared by every task via `Arc<AppState>`. Wraps
// the `TradingBook`, the exchange client, and the bounded rings (signals,
// errors) needed to build the dashboard snapshot, with a version counter the
// WebSocket feed uses to detect changes between pushes.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use crate::book::TradingBook;
use crate::config::Config;
use crate::exchange::Exchange;
use crate::types::{Signal, TradingMode};

const MAX_RECENT_ERRORS: usize = 50;
/// Global signal-history ring capacity (§5.D: "global 500").
const SIGNAL_HISTORY_CAPACITY: usize = 500;
/// Number of most-recent signals surfaced in the dashboard snapshot
/// (§5.H: "Last K signals ... K = 20"), derived from the full history
/// above rather than a capacity of its own.
const SNAPSHOT_SIGNAL_COUNT: usize = 20;
const MAX_PNL_HISTORY: usize = 50;

/// Multipliers applied to `position_size_usd` as a symbol's size ladder
/// steps down, one rung per LOT_SIZE/MIN_NOTIONAL rejection, per §7/§9.
/// The ladder is per-symbol, in-memory only, and resets on restart.
const POSITION_SIZE_LADDER: &[f64] = &[1.0, 0.5, 0.25, 0.1];

/// A recorded operational error for the dashboard error log, independent of
/// the typed `OrderOutcome` control-flow values used internally.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

/// The payload pushed to every connected `/ws` observer and returned by
/// `GET /api/v1/state`.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub timestamp: String,
    pub connected: bool,
    pub environment: String,
    pub trading_mode: TradingMode,
    pub balance: f64,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub active_positions: Vec<crate::types::Position>,
    pub recent_signals: Vec<SignalView>,
    pub pnl_history: Vec<f64>,
    pub win_rate: f64,
    pub trade_count: u64,
    pub uptime_seconds: u64,
    pub update_count: u64,
    pub connection_generation: u64,
}

/// Dashboard-facing view of a `Signal`, dropping the internal `Instant`.
#[derive(Debug, Clone, Serialize)]
pub struct SignalView {
    pub symbol: String,
    pub direction: String,
    pub strength: f64,
    pub reasoning: Vec<String>,
    pub at: String,
}

impl From<&Signal> for SignalView {
    fn from(s: &Signal) -> Self {
        Self {
            symbol: s.symbol.clone(),
            direction: s.direction.as_str().to_string(),
            strength: s.strength,
            reasoning: s.reasoning.iter().map(|t| format!("{t:?}")).collect(),
            at: s.at.clone(),
        }
    }
}

pub struct AppState {
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,
    connection_generation: AtomicU64,

    pub config: Arc<Config>,
    pub book: Arc<TradingBook>,
    pub exchange: Arc<dyn Exchange>,

    pub trading_mode: RwLock<TradingMode>,
    pub connected: RwLock<bool>,

    pub recent_signals: RwLock<Vec<Signal>>,
    pub pnl_history: RwLock<Vec<f64>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Per-symbol position-size ladder rung (index into
    /// `POSITION_SIZE_LADDER`), stepped down on LOT_SIZE/MIN_NOTIONAL
    /// rejections and never reset except by restart.
    position_size_rung: RwLock<HashMap<String, usize>>,

    /// Latest published snapshot, refreshed once per second by the broadcast
    /// loop regardless of whether any observer is connected (§5.H). The
    /// `/ws` handler subscribes rather than building its own copy, so that
    /// `pnl_history` samples exactly once per tick no matter how many
    /// observers are attached.
    snapshot_tx: watch::Sender<Arc<StateSnapshot>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, book: Arc<TradingBook>, exchange: Arc<dyn Exchange>) -> Self {
        let initial = Arc::new(StateSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            connected: false,
            environment: if config.use_testnet { "testnet" } else { "live" }.to_string(),
            trading_mode: TradingMode::Paused,
            balance: 0.0,
            total_pnl: 0.0,
            daily_pnl: 0.0,
            active_positions: Vec::new(),
            recent_signals: Vec::new(),
            pnl_history: Vec::new(),
            win_rate: 0.0,
            trade_count: 0,
            uptime_seconds: 0,
            update_count: 0,
            connection_generation: 0,
        });
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            state_version: AtomicU64::new(0),
            ws_sequence_number: AtomicU64::new(0),
            connection_generation: AtomicU64::new(0),
            config,
            book,
            exchange,
            trading_mode: RwLock::new(TradingMode::Paused),
            connected: RwLock::new(false),
            recent_signals: RwLock::new(Vec::new()),
            pnl_history: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            position_size_rung: RwLock::new(HashMap::new()),
            snapshot_tx,
            start_time: std::time::Instant::now(),
        }
    }

    /// Subscribe to the 1 Hz snapshot feed. New observers receive the
    /// latest published snapshot immediately via `Receiver::borrow`.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// The most recently published snapshot, without rebuilding or
    /// re-sampling it. REST reads use this so polling never duplicates the
    /// 1 Hz broadcast loop's `pnl_history` sampling (§5.H/§7).
    pub fn current_snapshot(&self) -> Arc<StateSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Build a fresh snapshot and publish it to every subscriber. Called
    /// once per second by the broadcast loop in `main`.
    pub fn publish_snapshot(&self, connection_generation: u64) -> Arc<StateSnapshot> {
        let snapshot = Arc::new(self.build_snapshot(connection_generation));
        let _ = self.snapshot_tx.send(snapshot.clone());
        snapshot
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn connection_generation(&self) -> u64 {
        self.connection_generation.load(Ordering::SeqCst)
    }

    pub fn set_connection_generation(&self, generation: u64) {
        self.connection_generation.store(generation, Ordering::SeqCst);
        self.increment_version();
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        let mut c = self.connected.write();
        if *c != connected {
            *c = connected;
            self.increment_version();
        }
    }

    pub fn set_trading_mode(&self, mode: TradingMode) {
        *self.trading_mode.write() = mode;
        self.increment_version();
    }

    pub fn push_error(&self, message: String, code: Option<String>) {
        let record = ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    pub fn push_signal(&self, signal: Signal) {
        let mut signals = self.recent_signals.write();
        signals.push(signal);
        while signals.len() > SIGNAL_HISTORY_CAPACITY {
            signals.remove(0);
        }
        self.increment_version();
    }

    /// Effective position size for `symbol`, after any LOT_SIZE/MIN_NOTIONAL
    /// rejections have stepped its size-ladder down this run (§7/§9).
    pub fn effective_position_size_usd(&self, symbol: &str) -> f64 {
        let rung = self.position_size_rung.read().get(symbol).copied().unwrap_or(0);
        let multiplier = POSITION_SIZE_LADDER[rung.min(POSITION_SIZE_LADDER.len() - 1)];
        self.config.position_size_usd * multiplier
    }

    /// Step `symbol`'s position-size ladder down one rung, floored at the
    /// smallest configured rung, in response to a LOT_SIZE/MIN_NOTIONAL
    /// rejection. The ladder is never reset except by process restart.
    pub fn step_down_position_size_ladder(&self, symbol: &str) {
        let mut rungs = self.position_size_rung.write();
        let rung = rungs.entry(symbol.to_string()).or_insert(0);
        if *rung + 1 < POSITION_SIZE_LADDER.len() {
            *rung += 1;
        }
        warn!(
            symbol,
            rung = *rung,
            multiplier = POSITION_SIZE_LADDER[*rung],
            "position-size ladder stepped down after filter rejection"
        );
    }

    /// Build a complete, serialisable snapshot of the engine state. Called
    /// once per second by the broadcast loop and on demand by
    /// `GET /api/v1/state`.
    pub fn build_snapshot(&self, connection_generation: u64) -> StateSnapshot {
        let risk = self.book.risk_snapshot();

        {
            let mut history = self.pnl_history.write();
            history.push(risk.total_pnl);
            while history.len() > MAX_PNL_HISTORY {
                history.remove(0);
            }
        }

        let signals: Vec<SignalView> = self
            .recent_signals
            .read()
            .iter()
            .rev()
            .take(SNAPSHOT_SIGNAL_COUNT)
            .map(SignalView::from)
            .collect();

        StateSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            connected: *self.connected.read(),
            environment: if self.config.use_testnet { "testnet" } else { "live" }.to_string(),
            trading_mode: *self.trading_mode.read(),
            balance: risk.current_balance,
            total_pnl: risk.total_pnl,
            daily_pnl: risk.daily_pnl,
            active_positions: self.book.open_positions(),
            recent_signals: signals,
            pnl_history: self.pnl_history.read().clone(),
            win_rate: self.book.win_rate(),
            trade_count: risk.trade_count,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            update_count: self.current_state_version(),
            connection_generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalTag;
    use std::time::Instant;

    fn app_state() -> AppState {
        let config = Arc::new(Config::default());
        let book = Arc::new(TradingBook::new(1000.0, 3, 25.0, 0.002, 0.006, 300));
        let exchange: Arc<dyn Exchange> =
            Arc::new(crate::exchange::ExchangeClient::new("k", "s", config.rest_base_url()));
        AppState::new(config, book, exchange)
    }

    #[test]
    fn push_error_caps_at_max_recent() {
        let state = app_state();
        for i in 0..60 {
            state.push_error(format!("err {i}"), None);
        }
        assert_eq!(state.recent_errors.read().len(), MAX_RECENT_ERRORS);
    }

    #[test]
    fn push_signal_increments_version() {
        let state = app_state();
        let before = state.current_state_version();
        state.push_signal(Signal {
            symbol: "BTCUSDT".into(),
            direction: crate::types::Direction::Buy,
            strength: 0.6,
            reasoning: vec![SignalTag::Momentum],
            timestamp: Instant::now(),
            at: Utc::now().to_rfc3339(),
        });
        assert!(state.current_state_version() > before);
    }

    #[test]
    fn build_snapshot_reflects_book_state() {
        let state = app_state();
        let snapshot = state.build_snapshot(1);
        assert_eq!(snapshot.trade_count, 0);
        assert!((snapshot.balance - 1000.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.connection_generation, 1);
    }

    fn fixture_signal(symbol: &str) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            direction: crate::types::Direction::Buy,
            strength: 0.6,
            reasoning: vec![SignalTag::Momentum],
            timestamp: Instant::now(),
            at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn signal_history_retains_far_more_than_the_snapshot_view() {
        let state = app_state();
        for i in 0..(SNAPSHOT_SIGNAL_COUNT + 50) {
            state.push_signal(fixture_signal(&format!("SYM{i}")));
        }
        assert_eq!(state.recent_signals.read().len(), SNAPSHOT_SIGNAL_COUNT + 50);

        let snapshot = state.build_snapshot(0);
        assert_eq!(snapshot.recent_signals.len(), SNAPSHOT_SIGNAL_COUNT);
    }

    #[test]
    fn signal_history_caps_at_global_capacity() {
        let state = app_state();
        for i in 0..(SIGNAL_HISTORY_CAPACITY + 20) {
            state.push_signal(fixture_signal(&format!("SYM{i}")));
        }
        assert_eq!(state.recent_signals.read().len(), SIGNAL_HISTORY_CAPACITY);
    }

    #[test]
    fn position_size_ladder_steps_down_and_floors() {
        let state = app_state();
        let base = state.config.position_size_usd;
        assert!((state.effective_position_size_usd("BTCUSDT") - base).abs() < f64::EPSILON);

        for _ in 0..10 {
            state.step_down_position_size_ladder("BTCUSDT");
        }
        let floor = base * POSITION_SIZE_LADDER.last().unwrap();
        assert!((state.effective_position_size_usd("BTCUSDT") - floor).abs() < f64::EPSILON);

        // Unaffected symbols stay at full size.
        assert!((state.effective_position_size_usd("ETHUSDT") - base).abs() < f64::EPSILON);
    }

    #[test]
    fn current_snapshot_does_not_resample_pnl_history() {
        let state = app_state();
        state.publish_snapshot(0);
        let before = state.pnl_history.read().len();
        let _ = state.current_snapshot();
        let _ = state.current_snapshot();
        assert_eq!(state.pnl_history.read().len(), before);
    }
}
