//! Performance summary over a set of closed positions.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade statistics and risk-adjusted returns for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    // === Basic Statistics ===
    /// Closed positions
    pub total_trades: u32,

    /// Net realized P&L after fees
    pub total_pnl: Decimal,

    /// Fees paid across every fill
    pub total_fees: Decimal,

    // === Win/Loss Metrics ===
    pub winning_trades: u32,
    pub losing_trades: u32,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    pub avg_win: Decimal,

    /// Average loss on losing trades (absolute value)
    pub avg_loss: Decimal,

    pub largest_win: Decimal,

    /// Most negative single-trade result
    pub largest_loss: Decimal,

    /// Gross profit / gross loss
    pub profit_factor: f64,

    /// Mean P&L per trade
    pub expectancy: Decimal,

    // === Risk Metrics ===
    /// Maximum peak-to-trough decline of the equity curve (0.0 to 1.0)
    pub max_drawdown: f64,

    pub max_drawdown_usd: Decimal,

    /// Annualized over 365 periods
    pub sharpe_ratio: f64,

    pub sortino_ratio: f64,

    // === Exits ===
    /// Closed positions per exit reason
    pub exits_by_reason: BTreeMap<String, u32>,

    /// Ladder slices taken before the final close
    pub partial_exits: u32,

    pub avg_holding_hours: f64,
}
