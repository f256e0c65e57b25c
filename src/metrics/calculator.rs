//! Performance statistics: win/loss, drawdown, Sharpe and Sortino.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{PerformanceReport, Position};

/// Periods per year used to annualize per-period returns.
const PERIODS_PER_YEAR: f64 = 365.0;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Summarize closed positions and the equity curve sampled alongside them.
    pub fn calculate(positions: &[Position], equity_curve: &[Decimal]) -> PerformanceReport {
        let mut report = PerformanceReport::default();
        let closed: Vec<&Position> = positions.iter().filter(|p| !p.is_open()).collect();

        if !closed.is_empty() {
            Self::calculate_trade_stats(&mut report, &closed);
        }
        Self::calculate_drawdown(&mut report, equity_curve);
        Self::calculate_sharpe_sortino(&mut report, equity_curve);
        report
    }

    fn calculate_trade_stats(report: &mut PerformanceReport, closed: &[&Position]) {
        let pnls: Vec<Decimal> = closed.iter().map(|p| p.realized_pnl).collect();
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|&&p| p > Decimal::ZERO);

        report.total_trades = closed.len() as u32;
        report.winning_trades = wins.len() as u32;
        report.losing_trades = losses.len() as u32;
        report.total_pnl = pnls.iter().copied().sum();
        report.total_fees = closed.iter().map(|p| p.fees).sum();
        report.win_rate = wins.len() as f64 / pnls.len() as f64;

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        if !wins.is_empty() {
            report.avg_win = gross_profit / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            report.avg_loss = gross_loss / Decimal::from(losses.len() as u32);
        }
        report.largest_win = wins.iter().copied().max().unwrap_or_default();
        report.largest_loss = losses.iter().copied().min().unwrap_or_default();

        if gross_loss > Decimal::ZERO {
            report.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        } else if gross_profit > Decimal::ZERO {
            report.profit_factor = f64::INFINITY;
        }
        report.expectancy = report.total_pnl / Decimal::from(pnls.len() as u32);

        for position in closed {
            let reason = position
                .exit_reason
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            *report.exits_by_reason.entry(reason).or_default() += 1;
            report.partial_exits += position
                .partial_exits
                .iter()
                .filter(|e| e.level.is_some())
                .count() as u32;
        }

        let hours: Vec<f64> = closed
            .iter()
            .filter_map(|p| p.exit_time.map(|t| (t - p.entry_time).num_minutes() as f64 / 60.0))
            .collect();
        if !hours.is_empty() {
            report.avg_holding_hours = hours.mean();
        }
    }

    /// Largest peak-to-trough decline of the equity curve.
    fn calculate_drawdown(report: &mut PerformanceReport, equity_curve: &[Decimal]) {
        let mut peak = Decimal::ZERO;
        for equity in equity_curve {
            if *equity > peak {
                peak = *equity;
            }
            if peak > Decimal::ZERO {
                let dd = peak - equity;
                if dd > report.max_drawdown_usd {
                    report.max_drawdown_usd = dd;
                }
                let dd_pct = (dd / peak).to_f64().unwrap_or(0.0);
                if dd_pct > report.max_drawdown {
                    report.max_drawdown = dd_pct;
                }
            }
        }
    }

    /// Ratios on per-period equity returns, zero risk-free rate.
    fn calculate_sharpe_sortino(report: &mut PerformanceReport, equity_curve: &[Decimal]) {
        let returns: Vec<f64> = equity_curve
            .windows(2)
            .filter(|w| w[0] > Decimal::ZERO)
            .filter_map(|w| ((w[1] - w[0]) / w[0]).to_f64())
            .collect();
        if returns.len() < 2 {
            return;
        }

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if std_dev > 0.0 {
            report.sharpe_ratio = mean / std_dev * PERIODS_PER_YEAR.sqrt();
        }

        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.len() >= 2 {
            let downside_dev = downside.iter().std_dev();
            if downside_dev > 0.0 {
                report.sortino_ratio = mean / downside_dev * PERIODS_PER_YEAR.sqrt();
            }
        }
    }
}
