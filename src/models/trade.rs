//! Trade side and order fills reported by the exchange.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Side of the order that flattens a position opened on this side.
    pub fn opposite(&self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Gross P&L of moving `quantity` from `entry` to `exit`.
    pub fn gross_pnl(&self, entry: Decimal, exit: Decimal, quantity: Decimal) -> Decimal {
        (exit - entry) * quantity * self.sign()
    }

    /// Shift a fill price against the holder when exiting a position on this side.
    pub fn exit_with_slippage(&self, price: Decimal, slippage_rate: Decimal) -> Decimal {
        let slip = price * slippage_rate;
        match self {
            TradeSide::Buy => price - slip,
            TradeSide::Sell => price + slip,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradeSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => anyhow::bail!("Unknown trade side: {}", other),
        }
    }
}

/// Result of a market order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub client_order_id: String,
    pub filled_quantity: Decimal,
    pub avg_price: Decimal,
    /// Commission in quote currency
    #[serde(default)]
    pub commission: Decimal,
}

impl OrderFill {
    pub fn notional(&self) -> Decimal {
        self.filled_quantity * self.avg_price
    }
}
