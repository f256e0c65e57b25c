//! Volatility bands, channels and true range.

use crate::models::Candle;

use super::{sma, wilder_smooth};

/// Upper/middle/lower band triple.
#[derive(Debug, Clone)]
pub struct Bands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Bollinger bands: SMA ± `k` population standard deviations.
pub fn bollinger(values: &[f64], period: usize, k: f64) -> Bands {
    let n = values.len();
    let middle = sma(values, period);
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];

    for i in 0..n {
        let mean = middle[i];
        if !mean.is_finite() {
            continue;
        }
        let window = &values[i + 1 - period..=i];
        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let sd = var.sqrt();
        upper[i] = mean + k * sd;
        lower[i] = mean - k * sd;
    }

    Bands {
        upper,
        middle,
        lower,
    }
}

/// True range. TR[0] is high - low since there is no previous close.
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(candles.len());
    for (i, c) in candles.iter().enumerate() {
        if i == 0 {
            tr.push(c.high - c.low);
            continue;
        }
        let pc = candles[i - 1].close;
        tr.push((c.high - c.low).max((c.high - pc).abs()).max((c.low - pc).abs()));
    }
    tr
}

/// Average true range with Wilder smoothing.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    wilder_smooth(&true_range(candles), period)
}

/// Rolling high/low channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Donchian channel over the last `period` candles, including the current one.
pub fn donchian(candles: &[Candle], period: usize) -> Channel {
    let n = candles.len();
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    if period == 0 || n < period {
        return Channel { upper, lower };
    }
    for i in (period - 1)..n {
        let window = &candles[i + 1 - period..=i];
        upper[i] = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        lower[i] = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    }
    Channel { upper, lower }
}
