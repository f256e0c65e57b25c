//! Technical indicators as pure functions over immutable candle windows.
//!
//! Every function returns a series aligned with its input, with `f64::NAN`
//! during warm-up. Callers read the value at the index they evaluate and treat
//! NaN as "not enough history".

mod momentum;
mod trend;
mod volatility;

pub use momentum::{pct_change, rsi, stochastic, Stochastic};
pub use trend::{adx, ema, macd, sma, Macd};
pub use volatility::{atr, bollinger, donchian, true_range, Bands, Channel};

use crate::models::Candle;

/// Close prices of a window.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Volumes of a window.
pub fn volumes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.volume).collect()
}

/// Value at `index`, or `None` when out of range or still warming up.
pub fn value_at(series: &[f64], index: usize) -> Option<f64> {
    series.get(index).copied().filter(|v| v.is_finite())
}

/// Latest value of a series, if defined.
pub fn last(series: &[f64]) -> Option<f64> {
    series.len().checked_sub(1).and_then(|i| value_at(series, i))
}

/// Value one step before the latest, if defined.
pub fn prev(series: &[f64]) -> Option<f64> {
    series.len().checked_sub(2).and_then(|i| value_at(series, i))
}

/// Wilder smoothing (alpha = 1/period), seeded with the mean of the first
/// `period` finite values.
pub(crate) fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 {
        return out;
    }

    let Some(start) = values.iter().position(|v| v.is_finite()) else {
        return out;
    };
    let seed_end = start + period;
    if seed_end > n || values[start..seed_end].iter().any(|v| !v.is_finite()) {
        return out;
    }

    let mut avg = values[start..seed_end].iter().sum::<f64>() / period as f64;
    out[seed_end - 1] = avg;
    for i in seed_end..n {
        if values[i].is_finite() {
            avg = (avg * (period as f64 - 1.0) + values[i]) / period as f64;
        }
        out[i] = avg;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wilder_seed_and_step() {
        let out = wilder_smooth(&[2.0, 4.0, 6.0, 8.0], 3);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert!((out[2] - 4.0).abs() < 1e-12);
        // (4 * 2 + 8) / 3
        assert!((out[3] - 16.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_last_and_prev() {
        let s = [f64::NAN, 1.0, 2.0];
        assert_eq!(last(&s), Some(2.0));
        assert_eq!(prev(&s), Some(1.0));
        assert_eq!(value_at(&s, 0), None);
        assert_eq!(last(&[]), None);
    }
}
