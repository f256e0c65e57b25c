//! Weighted vote of sub-strategy readings into one directional decision.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::models::{Candle, Direction, SignalReading, StrategyKind};
use crate::strategies::{build_generators, SignalGenerator, StrategyParams};

/// Weights and thresholds for one ensemble preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Relative weight per enabled strategy (normalized at build time)
    pub weights: BTreeMap<StrategyKind, f64>,

    /// Score needed for a full-confidence decision
    pub full_threshold: f64,

    /// Score needed for a partial decision backed by two or more votes
    pub partial_threshold: f64,

    /// Strength multiplier applied to partial decisions
    pub partial_factor: f64,

    /// Raw strength above which a lone strategy may decide on its own
    pub dominant_strength: f64,

    /// Candles required before the ensemble votes at all
    pub min_bars: usize,
}

impl EnsembleConfig {
    pub fn enabled_strategies(&self) -> Vec<StrategyKind> {
        self.weights.keys().copied().collect()
    }
}

/// Scale weights so they sum to 1.0.
pub fn normalize_weights(
    weights: &BTreeMap<StrategyKind, f64>,
) -> Result<BTreeMap<StrategyKind, f64>> {
    if weights.is_empty() {
        bail!("Ensemble has no weights");
    }
    if let Some((kind, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w <= 0.0) {
        bail!("Weight for {} must be positive, got {}", kind, w);
    }
    let total: f64 = weights.values().sum();
    Ok(weights.iter().map(|(k, w)| (*k, w / total)).collect())
}

/// How confident the ensemble is in its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    Full,
    Partial,
    Dominant,
    None,
}

/// Result of combining readings.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleDecision {
    pub direction: Direction,
    pub strength: f64,
    pub tier: ConfidenceTier,
    /// Weighted strength each strategy contributed to its side
    pub contributions: BTreeMap<StrategyKind, f64>,
    pub buy_votes: usize,
    pub sell_votes: usize,
    pub buy_score: f64,
    pub sell_score: f64,
}

impl EnsembleDecision {
    fn hold() -> Self {
        Self {
            direction: Direction::Hold,
            strength: 0.0,
            tier: ConfidenceTier::None,
            contributions: BTreeMap::new(),
            buy_votes: 0,
            sell_votes: 0,
            buy_score: 0.0,
            sell_score: 0.0,
        }
    }

    /// Collapse into a plain reading for the timeframe aligner.
    pub fn as_reading(&self) -> (Direction, f64) {
        (self.direction, self.strength)
    }
}

/// Combine readings with already-normalized weights.
pub fn combine(
    readings: &BTreeMap<StrategyKind, SignalReading>,
    weights: &BTreeMap<StrategyKind, f64>,
    config: &EnsembleConfig,
) -> EnsembleDecision {
    let mut decision = EnsembleDecision::hold();

    for (kind, reading) in readings {
        let weight = weights.get(kind).copied().unwrap_or(0.0);
        let weighted = reading.strength * weight;
        match reading.direction {
            Direction::Buy => {
                decision.buy_score += weighted;
                decision.buy_votes += 1;
            }
            Direction::Sell => {
                decision.sell_score += weighted;
                decision.sell_votes += 1;
            }
            Direction::Hold => continue,
        }
        decision.contributions.insert(*kind, weighted);
    }

    let (buy, sell) = (decision.buy_score, decision.sell_score);

    // Full confidence
    if buy > sell && buy >= config.full_threshold {
        return decision.with(Direction::Buy, buy, ConfidenceTier::Full);
    }
    if sell > buy && sell >= config.full_threshold {
        return decision.with(Direction::Sell, sell, ConfidenceTier::Full);
    }

    // Partial confidence needs agreement
    if buy > sell && buy >= config.partial_threshold && decision.buy_votes >= 2 {
        return decision.with(Direction::Buy, buy * config.partial_factor, ConfidenceTier::Partial);
    }
    if sell > buy && sell >= config.partial_threshold && decision.sell_votes >= 2 {
        return decision.with(
            Direction::Sell,
            sell * config.partial_factor,
            ConfidenceTier::Partial,
        );
    }

    // A single very strong strategy
    let strong: Vec<&SignalReading> = readings
        .values()
        .filter(|r| !r.direction.is_hold() && r.strength > config.dominant_strength)
        .collect();
    if let [lone] = strong.as_slice() {
        let weight = weights.get(&lone.source).copied().unwrap_or(0.0);
        return decision.with(lone.direction, lone.strength * weight, ConfidenceTier::Dominant);
    }

    decision
}

impl EnsembleDecision {
    fn with(mut self, direction: Direction, strength: f64, tier: ConfidenceTier) -> Self {
        self.direction = direction;
        self.strength = strength.clamp(0.0, 1.0);
        self.tier = tier;
        self
    }
}

/// Configured generators plus their normalized weights.
#[derive(Debug, Clone)]
pub struct Ensemble {
    generators: Vec<SignalGenerator>,
    weights: BTreeMap<StrategyKind, f64>,
    config: EnsembleConfig,
}

impl Ensemble {
    pub fn new(
        config: EnsembleConfig,
        allowed: &[StrategyKind],
        params: &StrategyParams,
    ) -> Result<Self> {
        let weights = normalize_weights(&config.weights)?;
        let generators = build_generators(&config.enabled_strategies(), allowed, params)?;
        Ok(Self {
            generators,
            weights,
            config,
        })
    }

    pub fn weights(&self) -> &BTreeMap<StrategyKind, f64> {
        &self.weights
    }

    /// Longest history any part of the ensemble asks for.
    pub fn required_history(&self) -> usize {
        self.generators
            .iter()
            .map(|g| g.min_history())
            .max()
            .unwrap_or(0)
            .max(self.config.min_bars)
    }

    /// Run every generator on the same window and vote.
    pub fn evaluate(&self, candles: &[Candle]) -> EnsembleDecision {
        if candles.len() < self.config.min_bars {
            return EnsembleDecision::hold();
        }
        let readings: BTreeMap<StrategyKind, SignalReading> = self
            .generators
            .iter()
            .map(|g| (g.kind(), g.generate(candles)))
            .collect();
        let decision = combine(&readings, &self.weights, &self.config);
        trace!(
            direction = %decision.direction,
            strength = decision.strength,
            buy_votes = decision.buy_votes,
            sell_votes = decision.sell_votes,
            "Ensemble vote"
        );
        decision
    }
}
