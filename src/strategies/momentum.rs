//! Fast-cadence momentum: short EMA cross confirmed by MACD, strength from
//! close-to-close velocity.

use serde::{Deserialize, Serialize};

use crate::indicators::{self, ema, macd, pct_change};
use crate::models::{Candle, SignalReading, StrategyKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumParams {
    pub fast_ema: usize,
    pub slow_ema: usize,
    pub signal_ema: usize,
    /// Velocity (in percent) that adds a full 1.0 of strength
    pub velocity_scale: f64,
}

#[derive(Debug, Clone)]
pub struct Momentum {
    params: MomentumParams,
}

impl Momentum {
    pub fn new(params: MomentumParams) -> Self {
        Self { params }
    }

    pub fn min_history(&self) -> usize {
        self.params.fast_ema.max(self.params.slow_ema) + 2
    }

    pub fn generate(&self, candles: &[Candle]) -> SignalReading {
        let kind = StrategyKind::Momentum;
        if candles.len() < self.min_history() {
            return SignalReading::hold(kind);
        }
        let p = &self.params;

        let closes = indicators::closes(candles);
        let fast = ema(&closes, p.fast_ema);
        let slow = ema(&closes, p.slow_ema);
        let m = macd(&closes, p.fast_ema, p.slow_ema, p.signal_ema);
        let velocity = pct_change(&closes, 1);

        let (Some(fast_now), Some(slow_now), Some(fast_prev), Some(slow_prev), Some(vel)) = (
            indicators::last(&fast),
            indicators::last(&slow),
            indicators::prev(&fast),
            indicators::prev(&slow),
            indicators::last(&velocity),
        ) else {
            return SignalReading::hold(kind);
        };
        // Signal line needs slow + signal bars; before that only the cross decides.
        let macd_now = indicators::last(&m.line);
        let signal_now = indicators::last(&m.signal);
        let macd_agrees = |bullish: bool| match (macd_now, signal_now) {
            (Some(line), Some(signal)) => (line > signal) == bullish,
            _ => true,
        };

        let strength = 0.5 + (vel * 100.0).abs() / p.velocity_scale;

        if fast_now > slow_now && fast_prev <= slow_prev && macd_agrees(true) {
            return SignalReading::buy(strength, kind);
        }
        if fast_now < slow_now && fast_prev >= slow_prev && macd_agrees(false) {
            return SignalReading::sell(strength, kind);
        }

        SignalReading::hold(kind)
    }
}
