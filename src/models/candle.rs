//! OHLCV candles and the timeframes they are sampled on.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV sample over a fixed time bucket. Never mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Whether every price/volume field is a finite number.
    pub fn is_finite(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
    }

    /// Time the bucket closes, given its timeframe.
    pub fn close_time(&self, timeframe: Timeframe) -> DateTime<Utc> {
        self.open_time + timeframe.duration()
    }
}

/// Candle bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    seconds: i64,
}

impl Timeframe {
    pub const M5: Timeframe = Timeframe { seconds: 300 };
    pub const M15: Timeframe = Timeframe { seconds: 900 };
    pub const H1: Timeframe = Timeframe { seconds: 3_600 };
    pub const H4: Timeframe = Timeframe { seconds: 14_400 };

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }

    /// Start of the bucket containing `time`.
    pub fn floor(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let ts = time.timestamp();
        let floored = ts - ts.rem_euclid(self.seconds);
        DateTime::from_timestamp(floored, 0).unwrap_or(time)
    }

    /// Next bucket boundary strictly after `time`.
    pub fn next_boundary(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(time) + self.duration()
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() < 2 {
            bail!("Invalid timeframe: {:?}", s);
        }
        let (count, unit) = s.split_at(s.len() - 1);
        let count: i64 = count
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid timeframe: {:?}", s))?;
        if count <= 0 {
            bail!("Invalid timeframe: {:?}", s);
        }
        let unit_secs = match unit {
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 604_800,
            _ => bail!("Unknown timeframe unit in {:?} (expected m, h, d or w)", s),
        };
        Ok(Self {
            seconds: count * unit_secs,
        })
    }
}

impl TryFrom<String> for Timeframe {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds;
        if s % 604_800 == 0 {
            write!(f, "{}w", s / 604_800)
        } else if s % 86_400 == 0 {
            write!(f, "{}d", s / 86_400)
        } else if s % 3_600 == 0 {
            write!(f, "{}h", s / 3_600)
        } else {
            write!(f, "{}m", s / 60)
        }
    }
}

/// Synthetic candles from close prices for tests.
///
/// open = previous close, high/low = ±0.5% around the body, volume 1000.
#[cfg(test)]
pub fn make_candles(closes: &[f64], timeframe: Timeframe) -> Vec<Candle> {
    let start = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Candle {
                open_time: start + timeframe.duration() * i as i32,
                open,
                high: open.max(close) * 1.005,
                low: open.min(close) * 0.995,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}
