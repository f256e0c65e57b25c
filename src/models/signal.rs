//! Directional readings produced by signal generators.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// Direction of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
        }
    }

    /// Trade side for an actionable direction.
    pub fn side(&self) -> Option<TradeSide> {
        match self {
            Direction::Buy => Some(TradeSide::Buy),
            Direction::Sell => Some(TradeSide::Sell),
            Direction::Hold => None,
        }
    }

    pub fn is_hold(&self) -> bool {
        *self == Direction::Hold
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of sub-strategy families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    MeanReversion,
    Breakout,
    TrendFollowing,
    Momentum,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::MeanReversion,
        StrategyKind::Breakout,
        StrategyKind::TrendFollowing,
        StrategyKind::Momentum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Breakout => "breakout",
            StrategyKind::TrendFollowing => "trend_following",
            StrategyKind::Momentum => "momentum",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "mean_reversion" | "meanreversion" => Ok(Self::MeanReversion),
            "breakout" => Ok(Self::Breakout),
            "trend_following" | "trendfollowing" => Ok(Self::TrendFollowing),
            "momentum" => Ok(Self::Momentum),
            other => bail!("Unknown strategy: {}", other),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generator's opinion about the latest candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalReading {
    pub direction: Direction,
    /// Conviction in [0, 1]
    pub strength: f64,
    pub source: StrategyKind,
}

impl SignalReading {
    pub fn hold(source: StrategyKind) -> Self {
        Self {
            direction: Direction::Hold,
            strength: 0.0,
            source,
        }
    }

    /// Build a reading, clamping strength into [0, 1].
    pub fn new(direction: Direction, strength: f64, source: StrategyKind) -> Self {
        if direction.is_hold() || !strength.is_finite() {
            return Self::hold(source);
        }
        Self {
            direction,
            strength: strength.clamp(0.0, 1.0),
            source,
        }
    }

    pub fn buy(strength: f64, source: StrategyKind) -> Self {
        Self::new(Direction::Buy, strength, source)
    }

    pub fn sell(strength: f64, source: StrategyKind) -> Self {
        Self::new(Direction::Sell, strength, source)
    }
}
