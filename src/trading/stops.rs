//! Stop-loss, take-profit, and trailing-stop price levels.

use rust_decimal::Decimal;

use super::config::{StopLossPolicy, TakeProfitPolicy, TrailingStopConfig};
use crate::models::TradeSide;

fn usable_atr(atr: Option<Decimal>) -> Option<Decimal> {
    atr.filter(|a| *a > Decimal::ZERO)
}

/// Distance from entry to the initial stop.
pub fn stop_distance(entry: Decimal, atr: Option<Decimal>, policy: &StopLossPolicy) -> Decimal {
    match policy {
        StopLossPolicy::Percent { pct } => entry * pct,
        StopLossPolicy::Atr {
            multiplier,
            fallback_pct,
        } => match usable_atr(atr) {
            Some(atr) => atr * multiplier,
            None => entry * fallback_pct,
        },
    }
}

pub fn stop_loss(
    entry: Decimal,
    side: TradeSide,
    atr: Option<Decimal>,
    policy: &StopLossPolicy,
) -> Decimal {
    let distance = stop_distance(entry, atr, policy);
    match side {
        TradeSide::Buy => (entry - distance).max(Decimal::ZERO),
        TradeSide::Sell => entry + distance,
    }
}

pub fn take_profit(
    entry: Decimal,
    side: TradeSide,
    stop: Decimal,
    policy: &TakeProfitPolicy,
) -> Decimal {
    let distance = match policy {
        TakeProfitPolicy::Percent { pct } => entry * pct,
        TakeProfitPolicy::RiskReward { ratio } => (entry - stop).abs() * ratio,
    };
    match side {
        TradeSide::Buy => entry + distance,
        TradeSide::Sell => (entry - distance).max(Decimal::ZERO),
    }
}

/// Candidate trailing stop for the latest price. Never looser than `current_stop`.
pub fn trailing_stop(
    current_stop: Decimal,
    price: Decimal,
    side: TradeSide,
    atr: Option<Decimal>,
    config: &TrailingStopConfig,
) -> Decimal {
    let distance = match usable_atr(atr) {
        Some(atr) => atr * config.atr_multiplier,
        None => price * config.fallback_pct,
    };
    match side {
        TradeSide::Buy => (price - distance).max(current_stop),
        TradeSide::Sell => (price + distance).min(current_stop),
    }
}

/// Money at risk and reward for a bracketed trade.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskMetrics {
    pub potential_loss: Decimal,
    pub potential_profit: Decimal,
    pub risk_reward: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
}

impl RiskMetrics {
    pub fn new(
        entry: Decimal,
        stop: Decimal,
        target: Decimal,
        quantity: Decimal,
        side: TradeSide,
    ) -> Self {
        let potential_loss = side.gross_pnl(stop, entry, quantity);
        let potential_profit = side.gross_pnl(entry, target, quantity);
        let risk_reward = if potential_loss > Decimal::ZERO {
            potential_profit / potential_loss
        } else {
            Decimal::ZERO
        };
        let pct = |level: Decimal| {
            if entry.is_zero() {
                Decimal::ZERO
            } else {
                ((level - entry) / entry).abs()
            }
        };
        Self {
            potential_loss,
            potential_profit,
            risk_reward,
            stop_loss_pct: pct(stop),
            take_profit_pct: pct(target),
        }
    }

    pub fn check(&self, min_risk_reward: Option<Decimal>) -> Result<(), String> {
        match min_risk_reward {
            Some(min) if self.risk_reward < min => Err(format!(
                "Risk-reward ratio {:.2} below minimum {}",
                self.risk_reward, min
            )),
            _ => Ok(()),
        }
    }
}
