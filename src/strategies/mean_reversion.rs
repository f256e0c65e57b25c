//! Mean reversion: Bollinger band extremes confirmed by RSI (and optionally %K).

use serde::{Deserialize, Serialize};

use crate::indicators::{self, bollinger, rsi, stochastic};
use crate::models::{Candle, SignalReading, StrategyKind};

/// Optional stochastic filter for faster cadences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StochasticFilter {
    pub k_period: usize,
    pub d_period: usize,
    pub oversold: f64,
    pub overbought: f64,
    /// Strength contribution at the extreme
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanReversionParams {
    pub bb_period: usize,
    pub bb_std: f64,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// How far inside the band still counts as a touch (0.01 = 1%)
    pub band_tolerance: f64,
    /// Base strength once triggered
    pub strength_floor: f64,
    /// RSI points past the threshold that add a full 1.0 of strength
    pub rsi_scale: f64,
    /// Added when the candle closed in the signal's direction
    pub confirm_bonus: f64,
    pub stochastic: Option<StochasticFilter>,
}

#[derive(Debug, Clone)]
pub struct MeanReversion {
    params: MeanReversionParams,
}

impl MeanReversion {
    pub fn new(params: MeanReversionParams) -> Self {
        Self { params }
    }

    pub fn min_history(&self) -> usize {
        let p = &self.params;
        let stoch = p
            .stochastic
            .as_ref()
            .map_or(0, |s| s.k_period + s.d_period);
        p.bb_period.max(p.rsi_period + 1).max(stoch).max(2)
    }

    pub fn generate(&self, candles: &[Candle]) -> SignalReading {
        let kind = StrategyKind::MeanReversion;
        if candles.len() < self.min_history() {
            return SignalReading::hold(kind);
        }
        let p = &self.params;

        let closes = indicators::closes(candles);
        let bands = bollinger(&closes, p.bb_period, p.bb_std);
        let rsi_series = rsi(&closes, p.rsi_period);

        let (Some(close), Some(prev_close), Some(upper), Some(lower), Some(rsi_now)) = (
            indicators::last(&closes),
            indicators::prev(&closes),
            indicators::last(&bands.upper),
            indicators::last(&bands.lower),
            indicators::last(&rsi_series),
        ) else {
            return SignalReading::hold(kind);
        };

        let stoch_k = match &p.stochastic {
            Some(f) => match indicators::last(&stochastic(candles, f.k_period, f.d_period).k) {
                Some(k) => Some((f, k)),
                None => return SignalReading::hold(kind),
            },
            None => None,
        };

        let near_lower = close <= lower * (1.0 + p.band_tolerance);
        let near_upper = close >= upper * (1.0 - p.band_tolerance);

        if near_lower && rsi_now < p.rsi_oversold {
            let mut strength = p.strength_floor + (p.rsi_oversold - rsi_now) / p.rsi_scale;
            if let Some((f, k)) = stoch_k {
                if k >= f.oversold {
                    return SignalReading::hold(kind);
                }
                strength += (f.oversold - k) / f.oversold * f.weight;
            }
            if close > prev_close {
                strength += p.confirm_bonus;
            }
            return SignalReading::buy(strength, kind);
        }

        if near_upper && rsi_now > p.rsi_overbought {
            let mut strength = p.strength_floor + (rsi_now - p.rsi_overbought) / p.rsi_scale;
            if let Some((f, k)) = stoch_k {
                if k <= f.overbought {
                    return SignalReading::hold(kind);
                }
                strength += (k - f.overbought) / (100.0 - f.overbought) * f.weight;
            }
            if close < prev_close {
                strength += p.confirm_bonus;
            }
            return SignalReading::sell(strength, kind);
        }

        SignalReading::hold(kind)
    }
}
