// =============================================================================
// Trading Book — Risk Ledger and open-positions map under one mutex
// =============================================================================
//
// The admission check reads the position count and the ledger together, and
// a close mutates both the position list and the ledger in the same step.
// Two independently-locked structures (as the reference engine splits
// RiskEngine and PositionManager) make that joint read/mutate a
// lock-ordering hazard; a single `parking_lot::RwLock` around both removes
// the hazard entirely at the cost of a slightly coarser critical section,
// which is acceptable since neither side does any I/O while holding it.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{ClosedTrade, Direction, ExitReason, Position, Side};

/// Reason admission was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    DailyLossBreached,
    MaxPositionsReached,
    PositionAlreadyOpen,
    InsufficientBalance,
    NotConnected,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DailyLossBreached => "daily loss limit breached",
            Self::MaxPositionsReached => "max open positions reached",
            Self::PositionAlreadyOpen => "position already open for symbol",
            Self::InsufficientBalance => "insufficient balance",
            Self::NotConnected => "not connected to market data stream",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of the ledger, suitable for the dashboard snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub starting_balance: f64,
    pub current_balance: f64,
    pub daily_pnl: f64,
    pub total_pnl: f64,
    pub trade_count: u64,
    pub winning_trades: u64,
}

struct Inner {
    starting_balance: f64,
    current_balance: f64,
    daily_pnl: f64,
    total_pnl: f64,
    trade_count: u64,
    winning_trades: u64,
    day_anchor: String,
    open_positions: Vec<Position>,
    closed_trades: Vec<ClosedTrade>,
}

/// Combined Risk Ledger and open-positions map, guarded by a single lock.
pub struct TradingBook {
    inner: RwLock<Inner>,
    max_positions: u32,
    max_daily_loss: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    max_hold_seconds: u64,
    max_closed_trades: usize,
}

const MAX_CLOSED_TRADES: usize = 500;

impl TradingBook {
    pub fn new(
        starting_balance: f64,
        max_positions: u32,
        max_daily_loss: f64,
        stop_loss_pct: f64,
        take_profit_pct: f64,
        max_hold_seconds: u64,
    ) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(starting_balance, max_positions, max_daily_loss, "trading book initialised");

        Self {
            inner: RwLock::new(Inner {
                starting_balance,
                current_balance: starting_balance,
                daily_pnl: 0.0,
                total_pnl: 0.0,
                trade_count: 0,
                winning_trades: 0,
                day_anchor: today,
                open_positions: Vec::new(),
                closed_trades: Vec::new(),
            }),
            max_positions,
            max_daily_loss,
            stop_loss_pct,
            take_profit_pct,
            max_hold_seconds,
            max_closed_trades: MAX_CLOSED_TRADES,
        }
    }

    /// Roll daily counters over at UTC date change. Checked on both the
    /// admission read path and the trade-result write path.
    fn maybe_reset_daily(&self, inner: &mut Inner) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if inner.day_anchor != today {
            info!(old_date = %inner.day_anchor, new_date = %today, "day rolled, resetting daily pnl");
            inner.daily_pnl = 0.0;
            inner.day_anchor = today;
        }
    }

    /// Admission check per §5.E: signed daily loss, position count cap,
    /// existing-position-for-symbol, balance, and stream connectivity.
    pub fn can_open_position(
        &self,
        symbol: &str,
        available_balance: f64,
        position_size_usd: f64,
        connected: bool,
    ) -> Result<(), DenyReason> {
        let mut inner = self.inner.write();
        self.maybe_reset_daily(&mut inner);

        if !connected {
            return Err(DenyReason::NotConnected);
        }
        if inner.daily_pnl <= -self.max_daily_loss {
            return Err(DenyReason::DailyLossBreached);
        }
        if inner.open_positions.len() as u32 >= self.max_positions {
            return Err(DenyReason::MaxPositionsReached);
        }
        if inner.open_positions.iter().any(|p| p.symbol == symbol) {
            return Err(DenyReason::PositionAlreadyOpen);
        }
        if available_balance < position_size_usd {
            return Err(DenyReason::InsufficientBalance);
        }

        Ok(())
    }

    /// Open a position. Panics if one already exists for `symbol` — admission
    /// must have been checked by the caller, so this would indicate a local
    /// invariant violation (no-pyramiding) rather than a recoverable error.
    pub fn open(&self, symbol: &str, direction: Direction, entry_price: f64, quantity: f64, now: Instant) -> Position {
        let mut inner = self.inner.write();
        if inner.open_positions.iter().any(|p| p.symbol == symbol) {
            panic!("attempted to open a second position for {symbol}, no-pyramiding invariant violated");
        }

        let side = direction.side();
        let (stop_loss_price, take_profit_price) = match side {
            Side::Long => (
                entry_price * (1.0 - self.stop_loss_pct),
                entry_price * (1.0 + self.take_profit_pct),
            ),
            Side::Short => (
                entry_price * (1.0 + self.stop_loss_pct),
                entry_price * (1.0 - self.take_profit_pct),
            ),
        };

        let position = Position {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            opened_at: now,
            opened_at_iso: Utc::now().to_rfc3339(),
            current_price: entry_price,
            unrealized_pnl: 0.0,
            stop_loss_price,
            take_profit_price,
            max_hold_deadline: now + std::time::Duration::from_secs(self.max_hold_seconds),
        };

        info!(symbol, %side, entry_price, quantity, "position opened");
        inner.open_positions.push(position.clone());
        position
    }

    /// Update `current_price`/`unrealized_pnl` for the position on `symbol`,
    /// if any. Constant-time.
    pub fn on_tick(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.write();
        if let Some(pos) = inner.open_positions.iter_mut().find(|p| p.symbol == symbol) {
            pos.mark(price);
        }
    }

    /// Evaluate every open position against the exit conditions in priority
    /// order (stop-loss > take-profit > max-hold > emergency) and return the
    /// symbols that should be closed, paired with their reason.
    pub fn positions_to_close(&self, now: Instant) -> Vec<(String, ExitReason)> {
        let inner = self.inner.read();
        inner
            .open_positions
            .iter()
            .filter_map(|p| Self::exit_reason(p, now).map(|r| (p.symbol.clone(), r)))
            .collect()
    }

    fn exit_reason(p: &Position, now: Instant) -> Option<ExitReason> {
        let stop_hit = match p.side {
            Side::Long => p.current_price <= p.stop_loss_price,
            Side::Short => p.current_price >= p.stop_loss_price,
        };
        if stop_hit {
            return Some(ExitReason::StopLoss);
        }

        let tp_hit = match p.side {
            Side::Long => p.current_price >= p.take_profit_price,
            Side::Short => p.current_price <= p.take_profit_price,
        };
        if tp_hit {
            return Some(ExitReason::TakeProfit);
        }

        if now >= p.max_hold_deadline {
            return Some(ExitReason::MaxHold);
        }

        None
    }

    /// Close the position on `symbol` at `exit_price`, realizing P&L into
    /// the ledger and moving it to the closed-trade journal.
    ///
    /// Returns the closed trade, or `None` if no position was open for the
    /// symbol (already closed by a concurrent sweep).
    pub fn close(&self, symbol: &str, exit_price: f64, reason: ExitReason) -> Option<ClosedTrade> {
        let mut inner = self.inner.write();
        let idx = inner.open_positions.iter().position(|p| p.symbol == symbol)?;
        let position = inner.open_positions.remove(idx);

        let realized_pnl = position.realized_pnl_at(exit_price);

        self.maybe_reset_daily(&mut inner);
        inner.current_balance += realized_pnl;
        inner.daily_pnl += realized_pnl;
        inner.total_pnl += realized_pnl;
        inner.trade_count += 1;
        if realized_pnl > 0.0 {
            inner.winning_trades += 1;
        }

        let trade = ClosedTrade {
            id: position.id,
            symbol: position.symbol,
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            realized_pnl,
            reason,
            opened_at_iso: position.opened_at_iso,
            closed_at_iso: Utc::now().to_rfc3339(),
        };

        info!(symbol = %trade.symbol, realized_pnl, %reason, "position closed");
        inner.closed_trades.push(trade.clone());
        while inner.closed_trades.len() > self.max_closed_trades {
            inner.closed_trades.remove(0);
        }

        Some(trade)
    }

    /// Force-delete a position without touching the ledger, used when an
    /// emergency close fails at the exchange: the books must stay consistent
    /// even though no P&L can be realized for an order that never landed.
    pub fn force_delete(&self, symbol: &str) {
        let mut inner = self.inner.write();
        if inner.open_positions.iter().any(|p| p.symbol == symbol) {
            warn!(symbol, "force-deleting local position after failed exchange close");
            inner.open_positions.retain(|p| p.symbol != symbol);
        }
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.inner.read().open_positions.clone()
    }

    pub fn recent_closed_trades(&self, count: usize) -> Vec<ClosedTrade> {
        let inner = self.inner.read();
        inner
            .closed_trades
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    pub fn risk_snapshot(&self) -> RiskSnapshot {
        let inner = self.inner.read();
        RiskSnapshot {
            starting_balance: inner.starting_balance,
            current_balance: inner.current_balance,
            daily_pnl: inner.daily_pnl,
            total_pnl: inner.total_pnl,
            trade_count: inner.trade_count,
            winning_trades: inner.winning_trades,
        }
    }

    pub fn win_rate(&self) -> f64 {
        let inner = self.inner.read();
        if inner.trade_count == 0 {
            0.0
        } else {
            inner.winning_trades as f64 / inner.trade_count as f64
        }
    }
}
