//! Channel breakout confirmed by volume and a minimum move relative to ATR.

use serde::{Deserialize, Serialize};

use crate::indicators::{self, atr, donchian, sma};
use crate::models::{Candle, SignalReading, StrategyKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutParams {
    /// Donchian lookback (channel of the candles before the current one)
    pub channel_period: usize,
    pub volume_period: usize,
    /// Volume / average volume needed to confirm
    pub volume_threshold: f64,
    /// Fraction of the threshold that is still accepted
    pub volume_tolerance: f64,
    /// How far inside the channel still counts as a break (0.001 = 0.1%)
    pub channel_tolerance: f64,
    pub atr_period: usize,
    /// Minimum distance past the channel in ATR units for a fresh break
    pub min_move_atr: f64,
    /// Strength factor for retests of an earlier break
    pub retest_factor: f64,
    /// Require close - close[n] to agree with the break
    pub momentum_lookback: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Breakout {
    params: BreakoutParams,
}

impl Breakout {
    pub fn new(params: BreakoutParams) -> Self {
        Self { params }
    }

    pub fn min_history(&self) -> usize {
        let p = &self.params;
        (p.channel_period + 2)
            .max(p.volume_period)
            .max(p.atr_period + 1)
            .max(p.momentum_lookback.unwrap_or(0) + 1)
    }

    pub fn generate(&self, candles: &[Candle]) -> SignalReading {
        let kind = StrategyKind::Breakout;
        if candles.len() < self.min_history() {
            return SignalReading::hold(kind);
        }
        let p = &self.params;
        let n = candles.len();

        let channel = donchian(candles, p.channel_period);
        let volumes = indicators::volumes(candles);
        let volume_ma = sma(&volumes, p.volume_period);
        let atr_series = atr(candles, p.atr_period);

        let close = candles[n - 1].close;
        let prev_close = candles[n - 2].close;
        let (Some(upper), Some(lower), Some(vol_ma), Some(atr_now)) = (
            indicators::prev(&channel.upper),
            indicators::prev(&channel.lower),
            indicators::last(&volume_ma),
            indicators::last(&atr_series),
        ) else {
            return SignalReading::hold(kind);
        };
        if vol_ma <= 0.0 {
            return SignalReading::hold(kind);
        }

        let volume_ratio = candles[n - 1].volume / vol_ma;
        let volume_ok = volume_ratio > p.volume_threshold * p.volume_tolerance;
        let momentum = p
            .momentum_lookback
            .map(|lb| close - candles[n - 1 - lb].close);
        let retest_strength = volume_ratio / p.volume_threshold * p.retest_factor;

        let breaks_up = close > upper * (1.0 - p.channel_tolerance)
            && volume_ok
            && momentum.map_or(true, |m| m > 0.0);
        if breaks_up {
            if close - upper >= p.min_move_atr * atr_now {
                let breakout_pct = (close - upper) / upper;
                return SignalReading::buy(0.5 + (breakout_pct * 50.0).min(0.5), kind);
            }
            if prev_close > upper {
                return SignalReading::buy(retest_strength, kind);
            }
        }

        let breaks_down = close < lower * (1.0 + p.channel_tolerance)
            && volume_ok
            && momentum.map_or(true, |m| m < 0.0);
        if breaks_down {
            if lower - close >= p.min_move_atr * atr_now {
                let breakdown_pct = (lower - close) / lower;
                return SignalReading::sell(0.5 + (breakdown_pct * 50.0).min(0.5), kind);
            }
            if prev_close < lower {
                return SignalReading::sell(retest_strength, kind);
            }
        }

        SignalReading::hold(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::candle::make_candles;
    use crate::models::{Direction, Timeframe};

    fn params() -> BreakoutParams {
        BreakoutParams {
            channel_period: 15,
            volume_period: 20,
            volume_threshold: 1.3,
            volume_tolerance: 0.85,
            channel_tolerance: 0.001,
            atr_period: 14,
            min_move_atr: 0.25,
            retest_factor: 0.6,
            momentum_lookback: None,
        }
    }

    fn range_then(last_close: f64, last_volume: f64) -> Vec<Candle> {
        let mut closes: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        closes.push(last_close);
        let mut candles = make_candles(&closes, Timeframe::H1);
        candles.last_mut().unwrap().volume = last_volume;
        candles
    }

    #[test]
    fn test_volume_confirmed_break_buys() {
        let r = Breakout::new(params()).generate(&range_then(106.0, 3000.0));
        assert_eq!(r.direction, Direction::Buy);
        assert!(r.strength >= 0.5);
    }

    #[test]
    fn test_break_without_volume_holds() {
        let r = Breakout::new(params()).generate(&range_then(106.0, 1000.0));
        assert_eq!(r.direction, Direction::Hold);
    }

    #[test]
    fn test_breakdown_sells() {
        let r = Breakout::new(params()).generate(&range_then(95.0, 3000.0));
        assert_eq!(r.direction, Direction::Sell);
    }

    #[test]
    fn test_retest_has_reduced_strength() {
        let mut closes: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        // Prior candle closed above the range, current one barely holds above it
        closes.push(102.0);
        closes.push(102.0);
        let mut candles = make_candles(&closes, Timeframe::H1);
        // Flatten the breakout candle so the channel stays at the old range
        let n = candles.len();
        candles[n - 2].high = 101.6;
        candles[n - 1].high = 102.1;
        candles[n - 1].low = 101.9;
        candles[n - 1].volume = 1500.0;

        let r = Breakout::new(params()).generate(&candles);
        assert_eq!(r.direction, Direction::Buy);
        assert!(r.strength < 0.8);
    }
}
