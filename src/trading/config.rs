//! Trading profiles: timeframes, ensemble presets, strategy parameters, and
//! risk parameters as plain data.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::aligner::AlignmentMode;
use super::ensemble::{normalize_weights, EnsembleConfig};
use crate::models::{LadderStep, StrategyKind, Timeframe};
use crate::strategies::{
    build_generators, BreakoutParams, MeanReversionParams, MomentumParams, StochasticFilter,
    StrategyParams, TrendFollowingParams,
};

/// Risk multipliers keyed by signal strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingTiers {
    pub very_strong: Decimal, // strength >= 0.8
    pub strong: Decimal,      // strength >= 0.6
    pub medium: Decimal,      // strength >= 0.4
    pub weak: Decimal,        // below 0.4
}

impl SizingTiers {
    pub fn multiplier(&self, strength: f64) -> Decimal {
        if strength >= 0.8 {
            self.very_strong
        } else if strength >= 0.6 {
            self.strong
        } else if strength >= 0.4 {
            self.medium
        } else {
            self.weak
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopLossPolicy {
    /// Fixed fraction of entry
    Percent { pct: Decimal },
    /// ATR multiple, falling back to a fraction of entry when ATR is missing
    Atr {
        multiplier: Decimal,
        fallback_pct: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TakeProfitPolicy {
    Percent { pct: Decimal },
    /// Multiple of the stop distance
    RiskReward { ratio: Decimal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    pub atr_multiplier: Decimal,
    /// Trail distance as a fraction of price when ATR is missing
    pub fallback_pct: Decimal,
}

/// What the circuit breaker does to positions that are already open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPolicy {
    /// Stop opening positions, leave open ones alone
    #[default]
    HaltEntries,
    /// Stop opening positions and flatten everything at market
    CloseAll,
}

/// Position sizing, brackets, and portfolio limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParameters {
    // === Sizing ===
    /// Base fraction of capital risked per trade
    pub risk_per_trade: Decimal,
    pub sizing_tiers: SizingTiers,
    pub min_position_usd: Decimal,
    pub max_position_usd: Decimal,

    // === Brackets ===
    pub stop_loss: StopLossPolicy,
    pub take_profit: TakeProfitPolicy,
    pub trailing: TrailingStopConfig,
    /// ATR lookback on the entry timeframe for stops and trailing
    pub atr_period: usize,
    /// Ordered (price fraction, quantity fraction) rungs; empty disables the ladder
    pub ladder: Vec<LadderStep>,
    /// Reject trades whose reward/risk is below this
    #[serde(default)]
    pub min_risk_reward: Option<Decimal>,

    // === Portfolio ===
    pub max_open_positions: usize,
    pub max_drawdown: Decimal,
    pub max_daily_loss: Decimal,
    #[serde(default)]
    pub breaker_policy: BreakerPolicy,

    // === Costs ===
    pub taker_fee: Decimal,
    pub slippage: Decimal,
}

impl RiskParameters {
    pub fn swing() -> Self {
        Self {
            risk_per_trade: dec!(0.015),      // 1.5% of capital
            sizing_tiers: SizingTiers {
                very_strong: dec!(1.5),
                strong: dec!(1.25),
                medium: dec!(1.0),
                weak: dec!(0.75),
            },
            min_position_usd: dec!(10),
            max_position_usd: dec!(10000),

            stop_loss: StopLossPolicy::Atr {
                multiplier: dec!(2.0),
                fallback_pct: dec!(0.025),    // 2.5% without ATR
            },
            take_profit: TakeProfitPolicy::Percent { pct: dec!(0.04) },
            trailing: TrailingStopConfig {
                enabled: true,
                atr_multiplier: dec!(2.0),
                fallback_pct: dec!(0.025),
            },
            atr_period: 14,
            ladder: vec![
                LadderStep::new(dec!(0.5), dec!(0.3)),
                LadderStep::new(dec!(0.75), dec!(0.4)),
                LadderStep::new(dec!(1.0), dec!(0.3)),
            ],
            min_risk_reward: None,

            max_open_positions: 6,
            max_drawdown: dec!(0.18),         // 18% from peak
            max_daily_loss: dec!(0.035),      // 3.5% of the day's starting equity
            breaker_policy: BreakerPolicy::HaltEntries,

            taker_fee: dec!(0.001),
            slippage: dec!(0.001),
        }
    }

    pub fn scalping() -> Self {
        Self {
            risk_per_trade: dec!(0.008),
            sizing_tiers: SizingTiers {
                very_strong: dec!(1.3),
                strong: dec!(1.1),
                medium: dec!(1.0),
                weak: dec!(0.8),
            },
            min_position_usd: dec!(5),
            max_position_usd: dec!(500),

            stop_loss: StopLossPolicy::Atr {
                multiplier: dec!(1.0),
                fallback_pct: dec!(0.018),
            },
            take_profit: TakeProfitPolicy::Percent { pct: dec!(0.035) },
            trailing: TrailingStopConfig {
                enabled: true,
                atr_multiplier: dec!(1.0),
                fallback_pct: dec!(0.018),
            },
            atr_period: 14,
            ladder: vec![
                LadderStep::new(dec!(0.5), dec!(0.25)),
                LadderStep::new(dec!(0.8), dec!(0.35)),
                LadderStep::new(dec!(1.0), dec!(0.4)),
            ],
            min_risk_reward: None,

            max_open_positions: 5,
            max_drawdown: dec!(0.12),
            max_daily_loss: dec!(0.025),
            breaker_policy: BreakerPolicy::HaltEntries,

            taker_fee: dec!(0.001),
            slippage: dec!(0.001),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.risk_per_trade <= Decimal::ZERO || self.risk_per_trade > dec!(0.1) {
            bail!("risk_per_trade must be in (0, 0.1], got {}", self.risk_per_trade);
        }
        if self.max_drawdown <= Decimal::ZERO || self.max_drawdown > dec!(0.5) {
            bail!("max_drawdown must be in (0, 0.5], got {}", self.max_drawdown);
        }
        if self.max_daily_loss <= Decimal::ZERO || self.max_daily_loss >= Decimal::ONE {
            bail!("max_daily_loss must be in (0, 1), got {}", self.max_daily_loss);
        }
        if self.atr_period == 0 {
            bail!("atr_period must be at least 1");
        }
        if self.max_open_positions == 0 {
            bail!("max_open_positions must be at least 1");
        }
        if self.min_position_usd < Decimal::ZERO || self.min_position_usd > self.max_position_usd
        {
            bail!(
                "Position value bounds are inverted: min {} > max {}",
                self.min_position_usd,
                self.max_position_usd
            );
        }
        let tiers = &self.sizing_tiers;
        if [tiers.very_strong, tiers.strong, tiers.medium, tiers.weak]
            .iter()
            .any(|m| *m <= Decimal::ZERO)
        {
            bail!("Sizing tier multipliers must be positive");
        }
        for (name, rate) in [("taker_fee", self.taker_fee), ("slippage", self.slippage)] {
            if rate < Decimal::ZERO || rate >= dec!(0.05) {
                bail!("{} must be in [0, 0.05), got {}", name, rate);
            }
        }
        match &self.stop_loss {
            StopLossPolicy::Percent { pct } if *pct <= Decimal::ZERO || *pct >= Decimal::ONE => {
                bail!("Stop-loss percent must be in (0, 1), got {}", pct)
            }
            StopLossPolicy::Atr {
                multiplier,
                fallback_pct,
            } if *multiplier <= Decimal::ZERO
                || *fallback_pct <= Decimal::ZERO
                || *fallback_pct >= Decimal::ONE =>
            {
                bail!("ATR stop needs a positive multiplier and a fallback in (0, 1)")
            }
            _ => {}
        }
        match &self.take_profit {
            TakeProfitPolicy::Percent { pct } if *pct <= Decimal::ZERO => {
                bail!("Take-profit percent must be positive, got {}", pct)
            }
            TakeProfitPolicy::RiskReward { ratio } if *ratio <= Decimal::ZERO => {
                bail!("Risk-reward ratio must be positive, got {}", ratio)
            }
            _ => {}
        }
        validate_ladder(&self.ladder)
    }
}

/// Ladder rungs must climb toward the target and close the whole position.
pub fn validate_ladder(ladder: &[LadderStep]) -> Result<()> {
    if ladder.is_empty() {
        return Ok(());
    }
    let mut last = Decimal::ZERO;
    for (i, step) in ladder.iter().enumerate() {
        if step.price_fraction <= last || step.price_fraction > Decimal::ONE {
            bail!(
                "Ladder level {} price fraction {} must increase and stay within (0, 1]",
                i + 1,
                step.price_fraction
            );
        }
        if step.quantity_fraction <= Decimal::ZERO {
            bail!("Ladder level {} has no quantity", i + 1);
        }
        last = step.price_fraction;
    }
    let total: Decimal = ladder.iter().map(|s| s.quantity_fraction).sum();
    if (total - Decimal::ONE).abs() > dec!(0.01) {
        bail!("Ladder quantities must sum to 1.0, got {}", total);
    }
    Ok(())
}

/// Ensemble strength needed to act, and the size used for weaker entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryGate {
    /// Full-size entry at or above this strength
    pub full: f64,
    /// Reduced-size entry at or above this strength
    pub partial: f64,
    /// Size multiplier for reduced entries
    pub partial_size: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Swing,
    Scalping,
}

impl FromStr for ProfileKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "swing" => Ok(Self::Swing),
            "scalping" | "scalp" => Ok(Self::Scalping),
            other => bail!("Unknown profile: {} (expected swing or scalping)", other),
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileKind::Swing => f.write_str("swing"),
            ProfileKind::Scalping => f.write_str("scalping"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsemblePreset {
    Conservative,
    Aggressive,
}

impl FromStr for EnsemblePreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "aggressive" => Ok(Self::Aggressive),
            other => bail!("Unknown ensemble preset: {}", other),
        }
    }
}

/// Everything one trading cadence needs. Both drivers read the same values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub kind: ProfileKind,
    pub symbols: Vec<String>,

    // === Timeframes ===
    pub primary_timeframe: Timeframe,
    pub entry_timeframe: Timeframe,
    pub alignment: AlignmentMode,

    // === Signals ===
    pub allowed_strategies: Vec<StrategyKind>,
    pub strategy_params: StrategyParams,
    pub ensemble: EnsembleConfig,
    pub entry_gate: EntryGate,

    // === Risk ===
    pub risk: RiskParameters,

    // === Data and pacing ===
    /// Candles requested per fetch
    pub candle_limit: usize,
    /// Replay starts evaluating after this many entry candles
    pub warmup_candles: usize,
    /// Minimum gap between entries on one symbol (live only)
    pub signal_cooldown_secs: i64,
    /// Wait after a candle boundary before fetching
    pub candle_wait_buffer_secs: i64,
    /// Latest candle older than this many intervals is stale
    pub stale_after_intervals: i64,
}

impl Profile {
    /// 1h entries filtered by the 4h trend.
    pub fn swing() -> Self {
        Self::with_preset(ProfileKind::Swing, EnsemblePreset::Conservative)
    }

    /// 5m entries filtered by the 15m trend.
    pub fn scalping() -> Self {
        Self::with_preset(ProfileKind::Scalping, EnsemblePreset::Conservative)
    }

    pub fn with_preset(kind: ProfileKind, preset: EnsemblePreset) -> Self {
        match kind {
            ProfileKind::Swing => Self {
                kind,
                symbols: ["BTCUSDT", "ETHUSDT", "SOLUSDT", "ADAUSDT"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                primary_timeframe: Timeframe::H4,
                entry_timeframe: Timeframe::H1,
                alignment: AlignmentMode::Strict,
                allowed_strategies: vec![
                    StrategyKind::MeanReversion,
                    StrategyKind::Breakout,
                    StrategyKind::TrendFollowing,
                ],
                strategy_params: swing_strategy_params(),
                ensemble: swing_ensemble(preset),
                entry_gate: EntryGate {
                    full: 0.48,
                    partial: 0.30,
                    partial_size: dec!(0.5),
                },
                risk: RiskParameters::swing(),
                candle_limit: 500,
                warmup_candles: 200,
                signal_cooldown_secs: 120,
                candle_wait_buffer_secs: 5,
                stale_after_intervals: 2,
            },
            ProfileKind::Scalping => Self {
                kind,
                symbols: ["BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                primary_timeframe: Timeframe::M15,
                entry_timeframe: Timeframe::M5,
                alignment: AlignmentMode::Permissive,
                allowed_strategies: vec![
                    StrategyKind::MeanReversion,
                    StrategyKind::Breakout,
                    StrategyKind::Momentum,
                ],
                strategy_params: scalping_strategy_params(),
                ensemble: scalping_ensemble(preset),
                entry_gate: EntryGate {
                    full: 0.30,
                    partial: 0.20,
                    partial_size: dec!(0.5),
                },
                risk: RiskParameters::scalping(),
                candle_limit: 500,
                warmup_candles: 200,
                signal_cooldown_secs: 120,
                candle_wait_buffer_secs: 5,
                stale_after_intervals: 2,
            },
        }
    }

    /// Load a complete profile from JSON (the format `config` prints).
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        let profile: Profile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse profile {}", path.display()))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary_timeframe == self.entry_timeframe {
            bail!(
                "Primary and entry timeframes must differ (both {})",
                self.entry_timeframe
            );
        }
        if self.symbols.is_empty() {
            bail!("No symbols configured");
        }
        normalize_weights(&self.ensemble.weights).context("Invalid ensemble weights")?;
        build_generators(
            &self.ensemble.enabled_strategies(),
            &self.allowed_strategies,
            &self.strategy_params,
        )?;
        let e = &self.ensemble;
        if e.partial_threshold > e.full_threshold {
            bail!("Ensemble partial threshold is above the full threshold");
        }
        let g = &self.entry_gate;
        if !(0.0..=1.0).contains(&g.full) || !(0.0..=1.0).contains(&g.partial) || g.partial > g.full
        {
            bail!("Entry gate needs 0 <= partial <= full <= 1");
        }
        if g.partial_size <= Decimal::ZERO || g.partial_size > Decimal::ONE {
            bail!("Partial entry size must be in (0, 1]");
        }
        if self.candle_limit < self.warmup_candles {
            bail!(
                "candle_limit {} is below warmup_candles {}",
                self.candle_limit,
                self.warmup_candles
            );
        }
        self.risk.validate().context("Invalid risk parameters")
    }
}

fn swing_strategy_params() -> StrategyParams {
    StrategyParams {
        mean_reversion: MeanReversionParams {
            bb_period: 20,
            bb_std: 2.0,
            rsi_period: 14,
            rsi_oversold: 35.0,
            rsi_overbought: 65.0,
            band_tolerance: 0.01,
            strength_floor: 0.0,
            rsi_scale: 20.0,
            confirm_bonus: 0.2,
            stochastic: None,
        },
        breakout: BreakoutParams {
            channel_period: 15,
            volume_period: 20,
            volume_threshold: 1.3,
            volume_tolerance: 0.85,
            channel_tolerance: 0.001,
            atr_period: 14,
            min_move_atr: 0.25,
            retest_factor: 0.6,
            momentum_lookback: None,
        },
        trend_following: TrendFollowingParams {
            fast_ema: 12,
            slow_ema: 26,
            signal_ema: 9,
            trend_ema: 150,
            adx_period: 14,
            adx_threshold: 18.0,
            trend_tolerance: 0.005,
        },
        momentum: MomentumParams {
            fast_ema: 12,
            slow_ema: 26,
            signal_ema: 9,
            velocity_scale: 50.0,
        },
    }
}

fn scalping_strategy_params() -> StrategyParams {
    StrategyParams {
        mean_reversion: MeanReversionParams {
            bb_period: 14,
            bb_std: 2.0,
            rsi_period: 7,
            rsi_oversold: 45.0,
            rsi_overbought: 55.0,
            band_tolerance: 0.05,
            strength_floor: 0.3,
            rsi_scale: 30.0,
            confirm_bonus: 0.15,
            stochastic: Some(StochasticFilter {
                k_period: 7,
                d_period: 3,
                oversold: 30.0,
                overbought: 80.0,
                weight: 0.2,
            }),
        },
        breakout: BreakoutParams {
            channel_period: 8,
            volume_period: 15,
            volume_threshold: 0.9,
            volume_tolerance: 0.8,
            channel_tolerance: 0.002,
            atr_period: 7,
            min_move_atr: 0.25,
            retest_factor: 0.6,
            momentum_lookback: Some(3),
        },
        trend_following: TrendFollowingParams {
            fast_ema: 7,
            slow_ema: 14,
            signal_ema: 5,
            trend_ema: 50,
            adx_period: 7,
            adx_threshold: 18.0,
            trend_tolerance: 0.005,
        },
        momentum: MomentumParams {
            fast_ema: 7,
            slow_ema: 14,
            signal_ema: 5,
            velocity_scale: 50.0,
        },
    }
}

fn swing_ensemble(preset: EnsemblePreset) -> EnsembleConfig {
    let (weights, full, partial) = match preset {
        EnsemblePreset::Conservative => ([0.25, 0.35, 0.40], 0.20, 0.12),
        EnsemblePreset::Aggressive => ([0.15, 0.50, 0.35], 0.24, 0.16),
    };
    EnsembleConfig {
        weights: BTreeMap::from([
            (StrategyKind::MeanReversion, weights[0]),
            (StrategyKind::Breakout, weights[1]),
            (StrategyKind::TrendFollowing, weights[2]),
        ]),
        full_threshold: full,
        partial_threshold: partial,
        partial_factor: 0.9,
        dominant_strength: 0.85,
        min_bars: 150,
    }
}

fn scalping_ensemble(preset: EnsemblePreset) -> EnsembleConfig {
    let (weights, full, partial) = match preset {
        EnsemblePreset::Conservative => ([0.35, 0.25, 0.40], 0.20, 0.12),
        EnsemblePreset::Aggressive => ([0.25, 0.35, 0.40], 0.16, 0.10),
    };
    EnsembleConfig {
        weights: BTreeMap::from([
            (StrategyKind::MeanReversion, weights[0]),
            (StrategyKind::Breakout, weights[1]),
            (StrategyKind::Momentum, weights[2]),
        ]),
        full_threshold: full,
        partial_threshold: partial,
        partial_factor: 0.85,
        dominant_strength: 0.85,
        min_bars: 20,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for kind in [ProfileKind::Swing, ProfileKind::Scalping] {
            for preset in [EnsemblePreset::Conservative, EnsemblePreset::Aggressive] {
                Profile::with_preset(kind, preset).validate().unwrap();
            }
        }
    }

    #[test]
    fn test_presets_differ_only_in_data() {
        let c = Profile::with_preset(ProfileKind::Swing, EnsemblePreset::Conservative);
        let a = Profile::with_preset(ProfileKind::Swing, EnsemblePreset::Aggressive);
        assert_ne!(c.ensemble, a.ensemble);
        assert_eq!(c.ensemble.enabled_strategies(), a.ensemble.enabled_strategies());
        assert_eq!(c.risk, a.risk);
    }

    #[test]
    fn test_ladder_tolerance() {
        let ok = [
            LadderStep::new(dec!(0.5), dec!(0.3)),
            LadderStep::new(dec!(0.75), dec!(0.4)),
            LadderStep::new(dec!(1.0), dec!(0.305)),
        ];
        assert!(validate_ladder(&ok).is_ok());

        let short = [
            LadderStep::new(dec!(0.5), dec!(0.3)),
            LadderStep::new(dec!(1.0), dec!(0.6)),
        ];
        let err = validate_ladder(&short).unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));

        let unordered = [
            LadderStep::new(dec!(0.75), dec!(0.5)),
            LadderStep::new(dec!(0.5), dec!(0.5)),
        ];
        assert!(validate_ladder(&unordered).is_err());
        assert!(validate_ladder(&[]).is_ok());
    }

    #[test]
    fn test_rejects_same_timeframes() {
        let mut p = Profile::swing();
        p.primary_timeframe = p.entry_timeframe;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_rejects_risk_out_of_range() {
        let mut p = Profile::swing();
        p.risk.risk_per_trade = dec!(0.2);
        assert!(p.validate().is_err());

        let mut p = Profile::swing();
        p.risk.max_drawdown = dec!(0.6);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_rejects_disallowed_strategy() {
        let mut p = Profile::swing();
        p.ensemble.weights.insert(StrategyKind::Momentum, 0.2);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_sizing_tiers() {
        let tiers = RiskParameters::swing().sizing_tiers;
        assert_eq!(tiers.multiplier(0.9), dec!(1.5));
        assert_eq!(tiers.multiplier(0.6), dec!(1.25));
        assert_eq!(tiers.multiplier(0.45), dec!(1.0));
        assert_eq!(tiers.multiplier(0.1), dec!(0.75));
    }

    #[test]
    fn test_profile_json_override() {
        let mut profile = Profile::scalping();
        profile.risk.breaker_policy = BreakerPolicy::CloseAll;
        profile.symbols = vec!["SOLUSDT".to_string()];

        let path = std::env::temp_dir().join(format!("profile-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string_pretty(&profile).unwrap()).unwrap();
        let loaded = Profile::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, profile);
    }

    #[test]
    fn test_unknown_profile_name() {
        assert!("daytrade".parse::<ProfileKind>().is_err());
        assert_eq!("Scalping".parse::<ProfileKind>().unwrap(), ProfileKind::Scalping);
    }
}
