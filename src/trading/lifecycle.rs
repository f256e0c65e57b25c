//! Per-observation advancement of an open position: ladder, stop, target,
//! trailing stop.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::config::RiskParameters;
use super::stops::trailing_stop;
use crate::models::{Candle, ExitReason, PartialExit, Position, PositionError};

/// The price information available at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceObservation {
    pub time: DateTime<Utc>,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl PriceObservation {
    /// Observation at the close of `candle`.
    pub fn from_candle(candle: &Candle, close_time: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            time: close_time,
            high: Decimal::from_f64(candle.high)?,
            low: Decimal::from_f64(candle.low)?,
            close: Decimal::from_f64(candle.close)?,
        })
    }
}

/// Something that happened to a position during one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    PartialExit {
        position_id: String,
        symbol: String,
        exit: PartialExit,
    },
    Closed {
        position_id: String,
        symbol: String,
        reason: ExitReason,
        exit: PartialExit,
        realized_pnl: Decimal,
    },
    StopTrailed {
        position_id: String,
        symbol: String,
        from: Decimal,
        to: Decimal,
    },
}

impl PositionEvent {
    /// Net PnL this event realized.
    pub fn realized(&self) -> Decimal {
        match self {
            PositionEvent::PartialExit { exit, .. } | PositionEvent::Closed { exit, .. } => {
                exit.pnl
            }
            PositionEvent::StopTrailed { .. } => Decimal::ZERO,
        }
    }
}

/// Advance `position` by one observation.
///
/// At most one of ladder rung, stop-loss, or final target fires per
/// observation, in that order. A position that survives has its trailing
/// stop ratcheted.
pub fn advance(
    position: &mut Position,
    obs: &PriceObservation,
    atr: Option<Decimal>,
    risk: &RiskParameters,
) -> Result<Vec<PositionEvent>, PositionError> {
    let mut events = Vec::new();
    if !position.is_open() {
        return Ok(events);
    }
    let side = position.side;

    let rung = position
        .next_level()
        .filter(|level| level.is_reached(side, obs.close))
        .map(|level| level.level);

    if let Some(level) = rung {
        match position.take_partial(level, obs.close, obs.time, risk.taker_fee)? {
            Some(exit) => {
                info!(
                    symbol = %position.symbol,
                    level,
                    price = %exit.price,
                    quantity = %exit.quantity,
                    pnl = %exit.pnl,
                    remaining = %position.remaining_quantity,
                    "Take-profit level hit"
                );
                if position.is_open() {
                    events.push(PositionEvent::PartialExit {
                        position_id: position.id.clone(),
                        symbol: position.symbol.clone(),
                        exit,
                    });
                } else {
                    events.push(closed_event(position, exit));
                }
            }
            None => debug!(
                symbol = %position.symbol,
                level,
                "Ladder slice under exchange minimums, folded into next rung"
            ),
        }
    } else if position.stop_breached(obs.low, obs.high) {
        let price = side.exit_with_slippage(position.stop_loss, risk.slippage);
        let exit = position.close(price, obs.time, ExitReason::StopLoss, risk.taker_fee)?;
        info!(symbol = %position.symbol, price = %price, pnl = %position.realized_pnl, "Stop-loss hit");
        events.push(closed_event(position, exit));
    } else if !position.has_ladder() && position.target_breached(obs.low, obs.high) {
        let price = side.exit_with_slippage(position.take_profit, risk.slippage);
        let exit = position.close(price, obs.time, ExitReason::TakeProfit, risk.taker_fee)?;
        info!(symbol = %position.symbol, price = %price, pnl = %position.realized_pnl, "Take-profit hit");
        events.push(closed_event(position, exit));
    }

    if position.is_open() && position.trailing_enabled {
        let candidate = trailing_stop(position.stop_loss, obs.close, side, atr, &risk.trailing);
        if let Some(from) = position.ratchet_stop(candidate) {
            debug!(symbol = %position.symbol, from = %from, to = %candidate, "Trailing stop moved");
            events.push(PositionEvent::StopTrailed {
                position_id: position.id.clone(),
                symbol: position.symbol.clone(),
                from,
                to: candidate,
            });
        }
    }

    Ok(events)
}

/// Close whatever remains at market with adverse slippage.
pub fn force_close(
    position: &mut Position,
    price: Decimal,
    time: DateTime<Utc>,
    reason: ExitReason,
    risk: &RiskParameters,
) -> Result<PositionEvent, PositionError> {
    let fill = position.side.exit_with_slippage(price, risk.slippage);
    let exit = position.close(fill, time, reason, risk.taker_fee)?;
    Ok(closed_event(position, exit))
}

fn closed_event(position: &Position, exit: PartialExit) -> PositionEvent {
    PositionEvent::Closed {
        position_id: position.id.clone(),
        symbol: position.symbol.clone(),
        reason: position.exit_reason.unwrap_or(ExitReason::Manual),
        exit,
        realized_pnl: position.realized_pnl,
    }
}
