// =============================================================================
// Signal Engine — deterministic momentum/trend scoring
// =============================================================================
//
// A pure function over `SymbolState`, invoked on every tick of the owning
// symbol. Strength-threshold and cooldown gating happen one layer up, in the
// trading loop, so this function can be tested in isolation from timing.
// =============================================================================

use std::time::Instant;

use crate::symbol_state::SymbolState;
use crate::types::{Direction, Signal, SignalTag};

const MOMENTUM_THRESHOLD: f64 = 0.0012;

/// Extension seam for an out-of-scope ML add-on: contributes an additional
/// signed scalar to `strength` before the emission threshold is checked. The
/// core ships no augmenter; `None` is the fully supported default path.
pub trait FeatureAugmenter: Send + Sync {
    fn adjust(&self, state: &SymbolState, direction: Direction) -> f64;
}

/// Evaluate `state` for a candidate signal. Returns `None` if momentum sits
/// inside the dead zone; otherwise a fully-scored `Signal` is returned
/// regardless of whether it would pass the caller's strength/cooldown gates.
pub fn evaluate(state: &SymbolState, augmenter: Option<&dyn FeatureAugmenter>) -> Option<Signal> {
    let momentum = state.momentum();

    let (direction, mut strength, mut tags) = if momentum > MOMENTUM_THRESHOLD {
        (Direction::Buy, 0.40, vec![SignalTag::Momentum])
    } else if momentum < -MOMENTUM_THRESHOLD {
        (Direction::Sell, 0.40, vec![SignalTag::Momentum])
    } else {
        return None;
    };

    let ma5 = state.ma5();
    let ma20 = state.ma20();
    match direction {
        Direction::Buy if ma5 > ma20 => {
            strength += 0.25;
            tags.push(SignalTag::MaCross);
        }
        Direction::Sell if ma5 < ma20 => {
            strength += 0.25;
            tags.push(SignalTag::MaCross);
        }
        _ => {}
    }

    let volume_ratio = state.volume_ratio();
    if volume_ratio >= 1.4 {
        strength += 0.20;
        tags.push(SignalTag::VolumeSpike);
    } else if volume_ratio >= 1.2 {
        strength += 0.10;
    }

    match direction {
        Direction::Buy if state.last_change_24h > 0.0 => {
            strength += 0.10;
            tags.push(SignalTag::TrendUp);
        }
        Direction::Sell if state.last_change_24h < 0.0 => {
            strength += 0.10;
            tags.push(SignalTag::TrendDown);
        }
        _ => {}
    }

    if let Some(aug) = augmenter {
        strength += aug.adjust(state, direction);
    }

    Some(Signal {
        symbol: state.symbol.clone(),
        direction,
        strength,
        reasoning: tags,
        timestamp: Instant::now(),
        at: chrono::Utc::now().to_rfc3339(),
    })
}
