// =============================================================================
// Shared types used across the scalping engine
// =============================================================================

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A single normalized ticker update for one symbol, received from the
/// Stream Client. `timestamp` is the monotonic wall-clock instant at
/// receipt, not the exchange's own event time — it is the clock every
/// downstream cooldown and max-hold calculation is measured against.
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    pub change_24h: f64,
    pub timestamp: Instant,
}

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively admitting new signals, paused, or killed.
/// Paused/Killed still allow the sweep loop to close existing positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Direction of a generated trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// The position side opened when acting on this direction.
    pub fn side(&self) -> Side {
        match self {
            Self::Buy => Side::Long,
            Self::Sell => Side::Short,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    /// The exchange order side that would close a position of this side.
    pub fn closing_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tag describing why a signal fired, for human inspection on the
/// dashboard. Deliberately a small closed set rather than free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTag {
    Momentum,
    MaCross,
    VolumeSpike,
    TrendUp,
    TrendDown,
}

/// A decision artifact produced by the signal engine. Emitting a `Signal`
/// does not imply an order was placed — admission and sizing happen
/// downstream in the trading loop.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    pub strength: f64,
    pub reasoning: Vec<SignalTag>,
    #[serde(skip)]
    pub timestamp: Instant,
    /// RFC3339 wall-clock timestamp, used for display/serialisation — the
    /// `timestamp` field (an `Instant`) is authoritative for cooldown math.
    pub at: String,
}

/// Reason an open position was closed, reported on the dashboard and in the
/// trade journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxHold,
    Emergency,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::MaxHold => "max_hold",
            Self::Emergency => "emergency",
        };
        write!(f, "{s}")
    }
}

/// An open exposure in a single symbol. At most one may exist per symbol at
/// any time (no pyramiding).
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    #[serde(skip)]
    pub opened_at: Instant,
    pub opened_at_iso: String,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    #[serde(skip)]
    pub max_hold_deadline: Instant,
}

impl Position {
    /// Recompute `unrealized_pnl` for a new mark. Constant time.
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.realized_pnl_at(price);
    }

    /// P&L if closed right now at `exit_price`.
    pub fn realized_pnl_at(&self, exit_price: f64) -> f64 {
        match self.side {
            Side::Long => (exit_price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - exit_price) * self.quantity,
        }
    }
}

/// A closed trade, retained for the trade journal and dashboard stats.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub reason: ExitReason,
    pub opened_at_iso: String,
    pub closed_at_iso: String,
}
