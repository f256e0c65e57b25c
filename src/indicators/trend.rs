//! Moving averages, MACD and ADX.

use crate::models::Candle;

use super::{true_range, wilder_smooth};

/// Simple moving average.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        if window.iter().all(|v| v.is_finite()) {
            out[i] = window.iter().sum::<f64>() / period as f64;
        }
    }
    out
}

/// Exponential moving average (alpha = 2 / (period + 1)).
///
/// Starts at the first finite input and reports values once `period`
/// samples have been folded in.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 {
        return out;
    }
    let Some(start) = values.iter().position(|v| v.is_finite()) else {
        return out;
    };

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut acc = values[start];
    let mut seen = 1usize;
    if period == 1 {
        out[start] = acc;
    }
    for i in (start + 1)..n {
        if values[i].is_finite() {
            acc = alpha * values[i] + (1.0 - alpha) * acc;
            seen += 1;
        }
        if seen >= period {
            out[i] = acc;
        }
    }
    out
}

/// MACD line, signal line and histogram.
#[derive(Debug, Clone)]
pub struct Macd {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    let line: Vec<f64> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ema(&line, signal);
    let histogram = line.iter().zip(&signal_line).map(|(l, s)| l - s).collect();
    Macd {
        line,
        signal: signal_line,
        histogram,
    }
}

/// Average Directional Index (Wilder).
pub fn adx(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    if n < 2 || period == 0 {
        return vec![f64::NAN; n];
    }

    let mut plus_dm = vec![f64::NAN; n];
    let mut minus_dm = vec![f64::NAN; n];
    for i in 1..n {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
    }

    // TR[0] has no previous close, keep the series aligned with the DM ones.
    let mut tr = true_range(candles);
    tr[0] = f64::NAN;

    let smooth_tr = wilder_smooth(&tr, period);
    let smooth_plus = wilder_smooth(&plus_dm, period);
    let smooth_minus = wilder_smooth(&minus_dm, period);

    let mut dx = vec![f64::NAN; n];
    for i in 0..n {
        let (t, p, m) = (smooth_tr[i], smooth_plus[i], smooth_minus[i]);
        if !(t.is_finite() && p.is_finite() && m.is_finite()) || t == 0.0 {
            continue;
        }
        let plus_di = 100.0 * p / t;
        let minus_di = 100.0 * m / t;
        let sum = plus_di + minus_di;
        dx[i] = if sum == 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / sum
        };
    }

    wilder_smooth(&dx, period)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::candle::make_candles;
    use crate::models::Timeframe;

    #[test]
    fn test_sma() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0], 2);
        assert!(out[0].is_nan());
        assert_eq!(&out[1..], &[1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_ema_constant_series() {
        let out = ema(&[5.0; 10], 3);
        assert!(out[1].is_nan());
        assert!(out[2..].iter().all(|v| (v - 5.0).abs() < 1e-12));
    }

    #[test]
    fn test_ema_skips_leading_nan() {
        let out = ema(&[f64::NAN, f64::NAN, 2.0, 2.0, 2.0], 2);
        assert!(out[2].is_nan());
        assert!((out[3] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_macd_sign_follows_trend() {
        let rising: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let m = macd(&rising, 12, 26, 9);
        let last = m.line.last().copied().unwrap();
        assert!(last > 0.0);

        let falling: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let m = macd(&falling, 12, 26, 9);
        assert!(m.line.last().copied().unwrap() < 0.0);
    }

    #[test]
    fn test_adx_strong_trend() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + 2.0 * i as f64).collect();
        let candles = make_candles(&closes, Timeframe::H1);
        let out = adx(&candles, 14);
        let last = out.last().copied().unwrap();
        assert!(last > 50.0, "adx = {last}");
        assert!(out[10].is_nan());
    }
}
