//! Portfolio guard: peak equity, drawdown, daily loss, and the entry gate.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::RiskParameters;

/// Drawdown above which every equity update logs a warning.
const DRAWDOWN_WARN: Decimal = dec!(0.05);

/// Result of the entry gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryValidation {
    pub allowed: bool,
    pub reason: String,
}

impl EntryValidation {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "OK".to_string(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Mutable risk bookkeeping; persisted with every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioRiskState {
    pub daily_pnl: Decimal,
    /// Equity at the first observation of the trading day
    pub daily_start_equity: Option<Decimal>,
    pub trading_day: Option<NaiveDate>,
    /// Highest equity ever observed
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    /// (peak - current) / peak
    pub current_drawdown: Decimal,
}

/// Gates new entries on open count, daily loss, and drawdown.
#[derive(Debug, Clone)]
pub struct PortfolioGuard {
    max_open_positions: usize,
    max_drawdown: Decimal,
    max_daily_loss: Decimal,
    state: PortfolioRiskState,
}

impl PortfolioGuard {
    pub fn new(risk: &RiskParameters) -> Self {
        Self {
            max_open_positions: risk.max_open_positions,
            max_drawdown: risk.max_drawdown,
            max_daily_loss: risk.max_daily_loss,
            state: PortfolioRiskState::default(),
        }
    }

    /// Resume from a persisted state.
    pub fn with_state(risk: &RiskParameters, state: PortfolioRiskState) -> Self {
        Self {
            state,
            ..Self::new(risk)
        }
    }

    pub fn state(&self) -> &PortfolioRiskState {
        &self.state
    }

    // ==================== Entry Gate ====================

    pub fn can_open(&self, open_count: usize) -> EntryValidation {
        if open_count >= self.max_open_positions {
            return EntryValidation::deny(format!(
                "Max open trades reached ({})",
                self.max_open_positions
            ));
        }
        if let Some(loss) = self.daily_loss_breach() {
            return EntryValidation::deny(format!(
                "Daily loss limit exceeded ({:.2}%)",
                loss * dec!(100)
            ));
        }
        if self.state.current_drawdown > self.max_drawdown {
            return EntryValidation::deny(format!(
                "Max drawdown exceeded ({:.2}%)",
                self.state.current_drawdown * dec!(100)
            ));
        }
        EntryValidation::allow()
    }

    /// Same limits as the entry gate, minus the open-count check.
    pub fn circuit_breaker_tripped(&self) -> Option<String> {
        if self.state.current_drawdown > self.max_drawdown {
            return Some(format!(
                "Drawdown {:.2}% exceeds limit {:.2}%",
                self.state.current_drawdown * dec!(100),
                self.max_drawdown * dec!(100)
            ));
        }
        self.daily_loss_breach().map(|loss| {
            format!(
                "Daily loss {:.2}% exceeds limit {:.2}%",
                loss * dec!(100),
                self.max_daily_loss * dec!(100)
            )
        })
    }

    /// Daily loss fraction, when it is a loss above the cap.
    fn daily_loss_breach(&self) -> Option<Decimal> {
        let start = self.state.daily_start_equity.filter(|e| *e > Decimal::ZERO)?;
        if self.state.daily_pnl >= Decimal::ZERO {
            return None;
        }
        let loss = self.state.daily_pnl.abs() / start;
        (loss > self.max_daily_loss).then_some(loss)
    }

    // ==================== Equity Tracking ====================

    /// Record an equity observation, rolling the trading day when it changes.
    pub fn update_equity(&mut self, current: Decimal, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.state.trading_day != Some(today) {
            if self.state.trading_day.is_some() {
                info!(day = %today, previous_pnl = %self.state.daily_pnl, "Daily tracking reset");
            }
            self.state.trading_day = Some(today);
            self.state.daily_pnl = Decimal::ZERO;
            self.state.daily_start_equity = Some(current);
        }

        self.state.current_equity = current;
        if current > self.state.peak_equity {
            self.state.peak_equity = current;
        }
        if self.state.peak_equity > Decimal::ZERO {
            self.state.current_drawdown =
                ((self.state.peak_equity - current) / self.state.peak_equity).max(Decimal::ZERO);
        }

        if self.state.current_drawdown > DRAWDOWN_WARN {
            warn!(
                drawdown = %self.state.current_drawdown.round_dp(4),
                peak = %self.state.peak_equity,
                current = %current,
                "Drawdown elevated"
            );
        }
    }

    /// Add realized PnL to today's total.
    pub fn record_realized(&mut self, pnl: Decimal) {
        self.state.daily_pnl += pnl;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn guard() -> PortfolioGuard {
        PortfolioGuard::new(&RiskParameters::swing())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_drawdown_denies_entry() {
        let mut g = guard();
        g.update_equity(dec!(10000), t0());
        g.update_equity(dec!(8000), t0());
        assert_eq!(g.state().current_drawdown, dec!(0.2));

        let v = g.can_open(0);
        assert!(!v.allowed);
        assert!(v.reason.starts_with("Max drawdown exceeded"));
        assert!(g.circuit_breaker_tripped().is_some());
    }

    #[test]
    fn test_max_open_positions() {
        let mut g = guard();
        g.update_equity(dec!(10000), t0());
        assert!(g.can_open(5).allowed);
        let v = g.can_open(6);
        assert_eq!(v, EntryValidation::deny("Max open trades reached (6)"));
    }

    #[test]
    fn test_daily_loss_limit() {
        let mut g = guard();
        g.update_equity(dec!(10000), t0());
        g.record_realized(dec!(-300));
        assert!(g.can_open(0).allowed);

        g.record_realized(dec!(-100));
        let v = g.can_open(0);
        assert!(v.reason.starts_with("Daily loss limit exceeded"));
        assert!(g.circuit_breaker_tripped().unwrap().starts_with("Daily loss"));
    }

    #[test]
    fn test_daily_reset_on_new_day() {
        let mut g = guard();
        g.update_equity(dec!(10000), t0());
        g.record_realized(dec!(-500));
        assert!(!g.can_open(0).allowed);

        g.update_equity(dec!(9500), t0() + Duration::days(1));
        assert_eq!(g.state().daily_pnl, Decimal::ZERO);
        assert_eq!(g.state().daily_start_equity, Some(dec!(9500)));
        assert!(g.can_open(0).allowed);
    }

    #[test]
    fn test_baseline_set_once_per_day() {
        let mut g = guard();
        g.update_equity(dec!(10000), t0());
        g.update_equity(dec!(12000), t0() + Duration::hours(3));
        assert_eq!(g.state().daily_start_equity, Some(dec!(10000)));
    }

    #[test]
    fn test_peak_monotonic_and_drawdown_non_negative() {
        let mut g = guard();
        let path = [10000, 10400, 9800, 11000, 10900, 12000, 7000, 12500];
        let mut last_peak = Decimal::ZERO;
        for (i, equity) in path.iter().enumerate() {
            g.update_equity(Decimal::from(*equity), t0() + Duration::hours(i as i64));
            assert!(g.state().peak_equity >= last_peak);
            assert!(g.state().current_drawdown >= Decimal::ZERO);
            last_peak = g.state().peak_equity;
        }
        assert_eq!(last_peak, dec!(12500));
        assert_eq!(g.state().current_drawdown, Decimal::ZERO);
    }

    #[test]
    fn test_breaker_quiet_when_healthy() {
        let mut g = guard();
        g.update_equity(dec!(10000), t0());
        g.update_equity(dec!(9500), t0());
        assert_eq!(g.circuit_breaker_tripped(), None);
    }
}
