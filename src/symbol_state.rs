// =============================================================================
// Symbol State — per-symbol rolling price/volume history
// =============================================================================
//
// Owned exclusively by that symbol's trading-loop task: no locking, since the
// tick handler is the sole writer and the signal function runs on the same
// task immediately after. `len(price_history) == len(volume_history)` is
// maintained by only ever pushing and evicting both together.
// =============================================================================

use std::collections::VecDeque;
use std::time::Instant;

const DEFAULT_CAPACITY: usize = 50;

/// Rolling window of recent ticks for one symbol, plus cooldown bookkeeping
/// for the signal engine.
pub struct SymbolState {
    pub symbol: String,
    capacity: usize,
    price_history: VecDeque<f64>,
    volume_history: VecDeque<f64>,
    pub last_price: f64,
    pub last_volume: f64,
    pub last_change_24h: f64,
    pub last_tick_timestamp: Option<Instant>,
    pub last_signal_timestamp: Option<Instant>,
}

impl SymbolState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_capacity(symbol, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(symbol: impl Into<String>, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            capacity,
            price_history: VecDeque::with_capacity(capacity),
            volume_history: VecDeque::with_capacity(capacity),
            last_price: 0.0,
            last_volume: 0.0,
            last_change_24h: 0.0,
            last_tick_timestamp: None,
            last_signal_timestamp: None,
        }
    }

    /// Append a new tick's price/volume, evicting the oldest sample if the
    /// ring is full.
    pub fn push(&mut self, price: f64, volume: f64, change_24h: f64, at: Instant) {
        self.price_history.push_back(price);
        self.volume_history.push_back(volume);
        while self.price_history.len() > self.capacity {
            self.price_history.pop_front();
            self.volume_history.pop_front();
        }

        self.last_price = price;
        self.last_volume = volume;
        self.last_change_24h = change_24h;
        self.last_tick_timestamp = Some(at);
    }

    pub fn sample_count(&self) -> usize {
        self.price_history.len()
    }

    /// `(price[-1] - price[-5]) / price[-5]`, or 0.0 with fewer than 5 samples.
    pub fn momentum(&self) -> f64 {
        if self.price_history.len() < 5 {
            return 0.0;
        }
        let last = *self.price_history.back().unwrap();
        let prev5 = self.price_history[self.price_history.len() - 5];
        if prev5 == 0.0 {
            return 0.0;
        }
        (last - prev5) / prev5
    }

    /// `mean(price[-5:])`.
    pub fn ma5(&self) -> f64 {
        Self::tail_mean(&self.price_history, 5)
    }

    /// `mean(price[-20:])` when ≥20 samples exist, else falls back to `ma5`.
    pub fn ma20(&self) -> f64 {
        if self.price_history.len() < 20 {
            return self.ma5();
        }
        Self::tail_mean(&self.price_history, 20)
    }

    /// `mean(volume[-10:])`.
    pub fn avg_volume(&self) -> f64 {
        Self::tail_mean(&self.volume_history, 10)
    }

    /// `last_volume / avg_volume`, or 0.0 if there is no volume history yet.
    pub fn volume_ratio(&self) -> f64 {
        let avg = self.avg_volume();
        if avg <= 0.0 {
            return 0.0;
        }
        self.last_volume / avg
    }

    fn tail_mean(buf: &VecDeque<f64>, n: usize) -> f64 {
        if buf.is_empty() {
            return 0.0;
        }
        let take = n.min(buf.len());
        let sum: f64 = buf.iter().rev().take(take).sum();
        sum / take as f64
    }
}
