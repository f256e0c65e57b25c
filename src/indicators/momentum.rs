//! Oscillators: RSI, stochastic, rate of change.

use crate::models::Candle;

use super::{sma, wilder_smooth};

/// Relative Strength Index with Wilder smoothing.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut gains = vec![f64::NAN; n];
    let mut losses = vec![f64::NAN; n];
    for i in 1..n {
        let change = values[i] - values[i - 1];
        if change.is_finite() {
            gains[i] = change.max(0.0);
            losses[i] = (-change).max(0.0);
        }
    }

    let avg_gain = wilder_smooth(&gains, period);
    let avg_loss = wilder_smooth(&losses, period);

    avg_gain
        .iter()
        .zip(&avg_loss)
        .map(|(&g, &l)| {
            if !(g.is_finite() && l.is_finite()) {
                f64::NAN
            } else if l == 0.0 {
                if g == 0.0 {
                    50.0
                } else {
                    100.0
                }
            } else {
                100.0 - 100.0 / (1.0 + g / l)
            }
        })
        .collect()
}

/// Stochastic oscillator %K and its %D smoothing.
#[derive(Debug, Clone)]
pub struct Stochastic {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

pub fn stochastic(candles: &[Candle], k_period: usize, d_period: usize) -> Stochastic {
    let n = candles.len();
    let mut k = vec![f64::NAN; n];
    if k_period > 0 && n >= k_period {
        for i in (k_period - 1)..n {
            let window = &candles[i + 1 - k_period..=i];
            let hh = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
            let ll = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
            let range = hh - ll;
            k[i] = if range > 0.0 {
                100.0 * (candles[i].close - ll) / range
            } else {
                50.0
            };
        }
    }
    let d = sma(&k, d_period);
    Stochastic { k, d }
}

/// Fractional change over `periods` steps.
pub fn pct_change(values: &[f64], periods: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    for i in periods..n {
        let base = values[i - periods];
        if base != 0.0 && base.is_finite() && values[i].is_finite() {
            out[i] = values[i] / base - 1.0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::candle::make_candles;
    use crate::models::Timeframe;

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let out = rsi(&rising, 14);
        assert!(out[13].is_nan());
        assert_eq!(out[14], 100.0);

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let out = rsi(&falling, 14);
        assert_eq!(out[29], 0.0);

        let flat = vec![3.0; 30];
        assert_eq!(rsi(&flat, 14)[29], 50.0);
    }

    #[test]
    fn test_rsi_balanced_moves() {
        let zigzag: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 10.0 } else { 11.0 }).collect();
        let last = *rsi(&zigzag, 14).last().unwrap();
        assert!((40.0..60.0).contains(&last), "rsi = {last}");
    }

    #[test]
    fn test_stochastic_bounds() {
        let closes: Vec<f64> = (0..20).map(|i| 50.0 + (i as f64).sin() * 5.0).collect();
        let candles = make_candles(&closes, Timeframe::M5);
        let st = stochastic(&candles, 7, 3);
        for v in st.k.iter().chain(&st.d).filter(|v| v.is_finite()) {
            assert!((0.0..=100.0).contains(v));
        }
        assert!(st.d[7].is_nan());
        assert!(st.d[8].is_finite());
    }

    #[test]
    fn test_pct_change() {
        let out = pct_change(&[100.0, 110.0, 99.0], 1);
        assert!(out[0].is_nan());
        assert!((out[1] - 0.1).abs() < 1e-12);
        assert!((out[2] + 0.1).abs() < 1e-12);
    }
}
