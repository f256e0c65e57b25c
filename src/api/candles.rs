//! Kline parsing and candle-series cleaning.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::warn;

use crate::models::{Candle, Timeframe};

use super::error::GatewayError;
use super::types::KlineRow;

/// Fewest candles a cleaned series may hold.
pub const MIN_CANDLES: usize = 20;
/// Warn when more than this share of intervals are missing.
const MAX_GAP_SHARE: f64 = 0.10;
/// A spacing above `interval * GAP_TOLERANCE` counts as a gap.
const GAP_TOLERANCE: f64 = 1.1;

/// Parse raw kline rows. Unparseable price fields become NaN and are
/// dropped by `clean_candles`.
pub fn parse_klines(rows: &[KlineRow]) -> Result<Vec<Candle>, GatewayError> {
    rows.iter()
        .map(|row| {
            if row.len() < 6 {
                return Err(GatewayError::Parse(format!(
                    "kline row has {} fields",
                    row.len()
                )));
            }
            let open_ms = row[0]
                .as_i64()
                .ok_or_else(|| GatewayError::Parse("kline open time is not an integer".into()))?;
            let open_time = DateTime::from_timestamp_millis(open_ms)
                .ok_or_else(|| GatewayError::Parse(format!("kline open time {} out of range", open_ms)))?;
            Ok(Candle {
                open_time,
                open: number(&row[1]),
                high: number(&row[2]),
                low: number(&row[3]),
                close: number(&row[4]),
                volume: number(&row[5]),
            })
        })
        .collect()
}

fn number(value: &Value) -> f64 {
    match value {
        Value::String(s) => s.parse().unwrap_or(f64::NAN),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Drop non-finite rows, sort, dedupe on open time, and drop any candle that
/// has not closed by `now`. Fails when fewer than `MIN_CANDLES` remain.
pub fn clean_candles(
    symbol: &str,
    mut candles: Vec<Candle>,
    timeframe: Timeframe,
    now: DateTime<Utc>,
) -> Result<Vec<Candle>, GatewayError> {
    let raw = candles.len();
    candles.retain(|c| c.is_finite() && c.close_time(timeframe) <= now);
    candles.sort_by_key(|c| c.open_time);
    candles.dedup_by_key(|c| c.open_time);

    if candles.len() < raw.saturating_sub(1) {
        warn!(
            symbol,
            dropped = raw - candles.len(),
            "Dropped invalid or duplicate candles"
        );
    }
    if candles.len() < MIN_CANDLES {
        return Err(GatewayError::InsufficientData {
            symbol: symbol.to_string(),
            got: candles.len(),
            min: MIN_CANDLES,
        });
    }

    let share = gap_share(&candles, timeframe);
    if share > MAX_GAP_SHARE {
        warn!(
            symbol,
            timeframe = %timeframe,
            gap_share = share,
            "Candle series has gaps"
        );
    }
    Ok(candles)
}

/// Share of consecutive pairs spaced wider than the tolerance.
pub fn gap_share(candles: &[Candle], timeframe: Timeframe) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }
    let limit = timeframe.seconds() as f64 * GAP_TOLERANCE;
    let gaps = candles
        .windows(2)
        .filter(|w| (w[1].open_time - w[0].open_time).num_seconds() as f64 > limit)
        .count();
    gaps as f64 / (candles.len() - 1) as f64
}

/// Whether the latest close is older than `intervals` bucket widths.
pub fn is_stale(candles: &[Candle], timeframe: Timeframe, now: DateTime<Utc>, intervals: i64) -> bool {
    match candles.last() {
        Some(last) => {
            now - last.close_time(timeframe) > Duration::seconds(timeframe.seconds() * intervals)
        }
        None => true,
    }
}
