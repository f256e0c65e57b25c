//! Sub-strategy signal generators and the closed registry that builds them.
//!
//! Generators are pure functions of the candle window they are given: no
//! state survives between calls, so the same window always yields the same
//! reading.

mod breakout;
mod mean_reversion;
mod momentum;
mod trend_following;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub use breakout::{Breakout, BreakoutParams};
pub use mean_reversion::{MeanReversion, MeanReversionParams, StochasticFilter};
pub use momentum::{Momentum, MomentumParams};
pub use trend_following::{TrendFollowing, TrendFollowingParams};

use crate::models::{Candle, SignalReading, StrategyKind};

/// Parameters for every family a profile may enable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    pub mean_reversion: MeanReversionParams,
    pub breakout: BreakoutParams,
    pub trend_following: TrendFollowingParams,
    pub momentum: MomentumParams,
}

/// A configured generator.
#[derive(Debug, Clone)]
pub enum SignalGenerator {
    MeanReversion(MeanReversion),
    Breakout(Breakout),
    TrendFollowing(TrendFollowing),
    Momentum(Momentum),
}

impl SignalGenerator {
    pub fn new(kind: StrategyKind, params: &StrategyParams) -> Self {
        match kind {
            StrategyKind::MeanReversion => {
                Self::MeanReversion(MeanReversion::new(params.mean_reversion.clone()))
            }
            StrategyKind::Breakout => Self::Breakout(Breakout::new(params.breakout.clone())),
            StrategyKind::TrendFollowing => {
                Self::TrendFollowing(TrendFollowing::new(params.trend_following.clone()))
            }
            StrategyKind::Momentum => Self::Momentum(Momentum::new(params.momentum.clone())),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::MeanReversion(_) => StrategyKind::MeanReversion,
            Self::Breakout(_) => StrategyKind::Breakout,
            Self::TrendFollowing(_) => StrategyKind::TrendFollowing,
            Self::Momentum(_) => StrategyKind::Momentum,
        }
    }

    /// Shortest window that can produce a non-HOLD reading.
    pub fn min_history(&self) -> usize {
        match self {
            Self::MeanReversion(s) => s.min_history(),
            Self::Breakout(s) => s.min_history(),
            Self::TrendFollowing(s) => s.min_history(),
            Self::Momentum(s) => s.min_history(),
        }
    }

    pub fn generate(&self, candles: &[Candle]) -> SignalReading {
        match self {
            Self::MeanReversion(s) => s.generate(candles),
            Self::Breakout(s) => s.generate(candles),
            Self::TrendFollowing(s) => s.generate(candles),
            Self::Momentum(s) => s.generate(candles),
        }
    }
}

/// Build generators for `enabled`, rejecting anything outside `allowed`.
pub fn build_generators(
    enabled: &[StrategyKind],
    allowed: &[StrategyKind],
    params: &StrategyParams,
) -> Result<Vec<SignalGenerator>> {
    if enabled.is_empty() {
        bail!("No strategies enabled");
    }
    let mut generators = Vec::with_capacity(enabled.len());
    for kind in enabled {
        if !allowed.contains(kind) {
            bail!(
                "Strategy {} is not allowed for this profile (allowed: {})",
                kind,
                allowed
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if generators.iter().any(|g: &SignalGenerator| g.kind() == *kind) {
            bail!("Strategy {} enabled twice", kind);
        }
        generators.push(SignalGenerator::new(*kind, params));
    }
    Ok(generators)
}
