//! Trend following: EMA crossover confirmed by MACD, filtered by a long EMA,
//! strength scaled by ADX.

use serde::{Deserialize, Serialize};

use crate::indicators::{self, adx, ema, macd};
use crate::models::{Candle, SignalReading, StrategyKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendFollowingParams {
    pub fast_ema: usize,
    pub slow_ema: usize,
    pub signal_ema: usize,
    pub trend_ema: usize,
    pub adx_period: usize,
    /// ADX level above which strength follows ADX/50
    pub adx_threshold: f64,
    /// Slack around the trend EMA (0.005 = 0.5%)
    pub trend_tolerance: f64,
}

#[derive(Debug, Clone)]
pub struct TrendFollowing {
    params: TrendFollowingParams,
}

impl TrendFollowing {
    pub fn new(params: TrendFollowingParams) -> Self {
        Self { params }
    }

    pub fn min_history(&self) -> usize {
        let p = &self.params;
        p.trend_ema
            .max(p.slow_ema + p.signal_ema)
            .max(2 * p.adx_period + 1)
            .max(2)
    }

    pub fn generate(&self, candles: &[Candle]) -> SignalReading {
        let kind = StrategyKind::TrendFollowing;
        if candles.len() < self.min_history() {
            return SignalReading::hold(kind);
        }
        let p = &self.params;

        let closes = indicators::closes(candles);
        let fast = ema(&closes, p.fast_ema);
        let slow = ema(&closes, p.slow_ema);
        let trend = ema(&closes, p.trend_ema);
        let m = macd(&closes, p.fast_ema, p.slow_ema, p.signal_ema);
        let adx_series = adx(candles, p.adx_period);

        let (
            Some(close),
            Some(fast_now),
            Some(slow_now),
            Some(fast_prev),
            Some(slow_prev),
            Some(trend_now),
            Some(macd_now),
            Some(signal_now),
            Some(adx_now),
        ) = (
            indicators::last(&closes),
            indicators::last(&fast),
            indicators::last(&slow),
            indicators::prev(&fast),
            indicators::prev(&slow),
            indicators::last(&trend),
            indicators::last(&m.line),
            indicators::last(&m.signal),
            indicators::last(&adx_series),
        )
        else {
            return SignalReading::hold(kind);
        };

        let strength = if adx_now > p.adx_threshold {
            (adx_now / 50.0).min(1.0)
        } else {
            0.5
        };

        let crossed_up = fast_now > slow_now && fast_prev <= slow_prev;
        if crossed_up && close > trend_now * (1.0 - p.trend_tolerance) && macd_now > signal_now {
            return SignalReading::buy(strength, kind);
        }

        let crossed_down = fast_now < slow_now && fast_prev >= slow_prev;
        if crossed_down && close < trend_now * (1.0 + p.trend_tolerance) && macd_now < signal_now {
            return SignalReading::sell(strength, kind);
        }

        SignalReading::hold(kind)
    }
}
