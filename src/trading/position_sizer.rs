//! Position sizing: strength-tiered fixed-fractional risk under exchange
//! quantization limits.

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;

use super::config::RiskParameters;
use crate::models::SymbolQuantization;

/// Why the sizer declined to produce a quantity.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SizingRejection {
    #[error("stop distance is zero")]
    ZeroStopDistance,

    #[error("entry price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("quantity {quantity} below exchange minimum {min_qty}")]
    BelowMinQuantity { quantity: Decimal, min_qty: Decimal },

    #[error("notional {notional} below exchange minimum {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },

    #[error("position value {value} below configured minimum {min_value}")]
    BelowMinValue { value: Decimal, min_value: Decimal },
}

/// Strength-scaled risk sizing.
pub struct PositionSizer<'a> {
    risk: &'a RiskParameters,
}

impl<'a> PositionSizer<'a> {
    pub fn new(risk: &'a RiskParameters) -> Self {
        Self { risk }
    }

    /// Fraction of capital risked for a signal of this strength.
    pub fn risk_fraction(&self, strength: f64) -> Decimal {
        self.risk.risk_per_trade * self.risk.sizing_tiers.multiplier(strength)
    }

    /// Quantity before quantization: risk amount spread over the stop distance.
    pub fn raw_quantity(
        &self,
        capital: Decimal,
        entry_price: Decimal,
        stop_price: Decimal,
        strength: f64,
    ) -> Result<Decimal, SizingRejection> {
        if entry_price <= Decimal::ZERO {
            return Err(SizingRejection::InvalidPrice(entry_price));
        }
        let stop_distance = (entry_price - stop_price).abs() / entry_price;
        if stop_distance.is_zero() {
            return Err(SizingRejection::ZeroStopDistance);
        }
        let risk_amount = capital * self.risk_fraction(strength);
        Ok(risk_amount / stop_distance / entry_price)
    }

    /// Final order quantity, or the reason no trade should be placed.
    pub fn size(
        &self,
        capital: Decimal,
        entry_price: Decimal,
        stop_price: Decimal,
        strength: f64,
        quantization: &SymbolQuantization,
    ) -> Result<Decimal, SizingRejection> {
        let raw = self.raw_quantity(capital, entry_price, stop_price, strength)?;
        let mut quantity = quantization.round_qty_down(raw);

        if quantity < quantization.min_qty {
            return Err(SizingRejection::BelowMinQuantity {
                quantity,
                min_qty: quantization.min_qty,
            });
        }
        let notional = quantity * entry_price;
        if notional < quantization.min_notional {
            return Err(SizingRejection::BelowMinNotional {
                notional,
                min_notional: quantization.min_notional,
            });
        }
        if notional < self.risk.min_position_usd {
            return Err(SizingRejection::BelowMinValue {
                value: notional,
                min_value: self.risk.min_position_usd,
            });
        }

        // Scale down to the value cap
        if notional > self.risk.max_position_usd {
            quantity = quantization.round_qty_down(self.risk.max_position_usd / entry_price);
            debug!(
                raw = %raw,
                capped = %quantity,
                max_value = %self.risk.max_position_usd,
                "Position capped at max value"
            );
        }
        if quantization.max_qty > Decimal::ZERO && quantity > quantization.max_qty {
            quantity = quantization.round_qty_down(quantization.max_qty);
        }

        // The caps can push a tiny order back under the exchange floors
        if quantity < quantization.min_qty {
            return Err(SizingRejection::BelowMinQuantity {
                quantity,
                min_qty: quantization.min_qty,
            });
        }
        let notional = quantity * entry_price;
        if notional < quantization.min_notional {
            return Err(SizingRejection::BelowMinNotional {
                notional,
                min_notional: quantization.min_notional,
            });
        }
        if notional < self.risk.min_position_usd {
            return Err(SizingRejection::BelowMinValue {
                value: notional,
                min_value: self.risk.min_position_usd,
            });
        }

        Ok(quantity)
    }
}
