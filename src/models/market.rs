//! Exchange quantization rules for a traded symbol.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Lot/price/notional filters the exchange enforces on orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolQuantization {
    /// Quantity increment
    pub step_size: Decimal,

    /// Smallest order quantity
    pub min_qty: Decimal,

    /// Largest order quantity
    pub max_qty: Decimal,

    /// Price increment
    pub tick_size: Decimal,

    /// Smallest order price
    #[serde(default)]
    pub min_price: Decimal,

    /// Largest order price (zero means unbounded)
    #[serde(default)]
    pub max_price: Decimal,

    /// Smallest price * quantity
    pub min_notional: Decimal,
}

impl Default for SymbolQuantization {
    /// Filters used when replaying history without exchange metadata.
    fn default() -> Self {
        Self {
            step_size: dec!(0.00001),
            min_qty: dec!(0.001),
            max_qty: dec!(9000000),
            tick_size: dec!(0.01),
            min_price: Decimal::ZERO,
            max_price: Decimal::ZERO,
            min_notional: dec!(10),
        }
    }
}

impl SymbolQuantization {
    /// Round a quantity down to the step size.
    pub fn round_qty_down(&self, quantity: Decimal) -> Decimal {
        round_down_to(quantity, self.step_size)
    }

    /// Round a price down to the tick size.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_down_to(price, self.tick_size)
    }

    /// Check an order against every filter.
    ///
    /// Returns a description of the first violated filter.
    pub fn validate_order(&self, quantity: Decimal, price: Decimal) -> Result<(), String> {
        if quantity < self.min_qty {
            return Err(format!("Quantity {} below minimum {}", quantity, self.min_qty));
        }
        if self.max_qty > Decimal::ZERO && quantity > self.max_qty {
            return Err(format!("Quantity {} above maximum {}", quantity, self.max_qty));
        }
        if self.step_size > Decimal::ZERO && !((quantity - self.min_qty) % self.step_size).is_zero() {
            return Err(format!(
                "Quantity {} does not comply with step size {}",
                quantity, self.step_size
            ));
        }
        if price < self.min_price {
            return Err(format!("Price {} below minimum {}", price, self.min_price));
        }
        if self.max_price > Decimal::ZERO && price > self.max_price {
            return Err(format!("Price {} above maximum {}", price, self.max_price));
        }
        if self.tick_size > Decimal::ZERO && !((price - self.min_price) % self.tick_size).is_zero() {
            return Err(format!(
                "Price {} does not comply with tick size {}",
                price, self.tick_size
            ));
        }
        let notional = quantity * price;
        if notional < self.min_notional {
            return Err(format!(
                "Notional {} below minimum {}",
                notional, self.min_notional
            ));
        }
        Ok(())
    }
}

/// Round `value` down to a multiple of `step`. A non-positive step leaves it unchanged.
pub fn round_down_to(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).floor();
    (steps * step).normalize()
}
