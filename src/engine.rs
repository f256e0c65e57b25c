//! The decision engine shared by the replay and live drivers.
//!
//! Drivers feed it closed candles, prices, fills, and equity; the engine owns
//! the open-position set and the portfolio guard. Nothing here reads the
//! clock or touches the network, which is what keeps replays and live runs
//! on the same decisions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::indicators::{self, atr};
use crate::models::{
    Candle, ExitReason, OpenRequest, OrderFill, Position, PositionError, SymbolQuantization,
    TradeSide,
};
use crate::trading::lifecycle::{self, PositionEvent, PriceObservation};
use crate::trading::stops::{self, RiskMetrics};
use crate::trading::{
    align, Alignment, Ensemble, EnsembleDecision, PortfolioGuard, PortfolioRiskState,
    PositionSizer, Profile, SizingRejection,
};

/// Everything the engine concluded about one symbol at one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSnapshot {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub primary: EnsembleDecision,
    pub entry: EnsembleDecision,
    pub alignment: Alignment,
}

/// Size class of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTier {
    Full,
    Partial,
}

/// An approved entry, ready for order placement.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub symbol: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub strength: f64,
    pub tier: EntryTier,
    pub atr: Option<Decimal>,
    pub risk: RiskMetrics,
}

/// Why no entry was planned this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoSignal(&'static str),
    BelowEntryGate(f64),
    AlreadyOpen,
    Guard(String),
    Cooldown,
    Sizing(SizingRejection),
    Filters(String),
    RiskReward(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoSignal(reason) => write!(f, "no signal: {}", reason),
            SkipReason::BelowEntryGate(s) => write!(f, "strength {:.3} below entry gate", s),
            SkipReason::AlreadyOpen => f.write_str("position already open for symbol"),
            SkipReason::Guard(reason) => write!(f, "guard: {}", reason),
            SkipReason::Cooldown => f.write_str("signal cooldown active"),
            SkipReason::Sizing(reason) => write!(f, "sizing: {}", reason),
            SkipReason::Filters(reason) => write!(f, "exchange filters: {}", reason),
            SkipReason::RiskReward(reason) => f.write_str(reason),
        }
    }
}

/// Events from one management pass plus any positions that closed.
#[derive(Debug, Default)]
pub struct ManageOutcome {
    pub events: Vec<PositionEvent>,
    pub closed: Vec<Position>,
}

impl ManageOutcome {
    /// Net PnL realized by this pass.
    pub fn realized(&self) -> Decimal {
        self.events.iter().map(PositionEvent::realized).sum()
    }
}

/// Closed history for one symbol at one tick. The last entry candle is the
/// one that just closed.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub symbol: &'a str,
    pub now: DateTime<Utc>,
    pub primary: &'a [Candle],
    pub entry: &'a [Candle],
    pub quantization: &'a SymbolQuantization,
}

/// A signal and what the engine made of it.
#[derive(Debug, Clone)]
pub struct EntryDecision {
    pub signal: SignalSnapshot,
    pub plan: Result<EntryPlan, SkipReason>,
}

/// Everything one `step` did for a symbol.
#[derive(Debug)]
pub struct StepOutcome {
    pub observation: PriceObservation,
    /// Side of the position that was managed, if one was open
    pub managed_side: Option<TradeSide>,
    pub managed: ManageOutcome,
    /// Equity the guard was updated with and entries were sized from
    pub equity: Decimal,
    pub breaker: Option<String>,
    /// Present whenever the symbol was flat after management
    pub entry: Option<EntryDecision>,
}

pub struct Engine {
    profile: Profile,
    ensemble: Ensemble,
    guard: PortfolioGuard,
    positions: BTreeMap<String, Position>,
    last_entry: HashMap<String, DateTime<Utc>>,
}

impl Engine {
    pub fn new(profile: Profile) -> Result<Self> {
        profile.validate()?;
        let ensemble = Ensemble::new(
            profile.ensemble.clone(),
            &profile.allowed_strategies,
            &profile.strategy_params,
        )
        .context("Failed to build ensemble")?;
        let guard = PortfolioGuard::new(&profile.risk);
        Ok(Self {
            profile,
            ensemble,
            guard,
            positions: BTreeMap::new(),
            last_entry: HashMap::new(),
        })
    }

    /// Resume with persisted guard state and previously open positions.
    pub fn restore(
        profile: Profile,
        state: PortfolioRiskState,
        open: impl IntoIterator<Item = Position>,
    ) -> Result<Self> {
        let mut engine = Self::new(profile)?;
        engine.guard = PortfolioGuard::with_state(&engine.profile.risk, state);
        for position in open.into_iter().filter(|p| p.is_open()) {
            engine.positions.insert(position.symbol.clone(), position);
        }
        Ok(engine)
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn guard(&self) -> &PortfolioGuard {
        &self.guard
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Entry candles needed before any sub-strategy can fire.
    pub fn required_history(&self) -> usize {
        self.ensemble.required_history()
    }

    /// Latest ATR of the entry series.
    pub fn atr(&self, entry: &[Candle]) -> Option<Decimal> {
        let series = atr(entry, self.profile.risk.atr_period);
        indicators::last(&series)
            .and_then(Decimal::from_f64)
            .filter(|a| *a > Decimal::ZERO)
    }

    // ==================== Step ====================

    /// One tick for one symbol: advance any open position on the candle that
    /// just closed, update the guard, check the breaker, and evaluate an
    /// entry if the symbol is flat. A position closed on this candle can be
    /// replaced on the same candle.
    ///
    /// `equity` reports account equity once management has run. Returns
    /// `None` when there is no usable closing candle.
    pub fn step(
        &mut self,
        input: &StepInput<'_>,
        equity: impl FnOnce(&Engine, &PriceObservation, &ManageOutcome) -> Decimal,
    ) -> Result<Option<StepOutcome>, PositionError> {
        let Some(obs) = input.entry.last().and_then(|c| {
            PriceObservation::from_candle(c, c.close_time(self.profile.entry_timeframe))
        }) else {
            return Ok(None);
        };
        let symbol = input.symbol;
        let atr = self.atr(input.entry);

        let managed_side = self.positions.get(symbol).map(|p| p.side);
        let managed = self.manage(symbol, &obs, atr)?;

        let equity = equity(&*self, &obs, &managed);
        self.update_equity(equity, input.now);

        let mut outcome = StepOutcome {
            observation: obs,
            managed_side,
            managed,
            equity,
            breaker: self.circuit_breaker(),
            entry: None,
        };
        if outcome.breaker.is_some() || self.positions.contains_key(symbol) {
            return Ok(Some(outcome));
        }

        let signal = self.decide(symbol, input.now, input.primary, input.entry);
        let plan = self.plan_entry(&signal, obs.close, atr, equity, input.quantization);
        outcome.entry = Some(EntryDecision { signal, plan });
        Ok(Some(outcome))
    }

    // ==================== Signals ====================

    /// Vote on both timeframes and align the results.
    pub fn decide(
        &self,
        symbol: &str,
        time: DateTime<Utc>,
        primary: &[Candle],
        entry: &[Candle],
    ) -> SignalSnapshot {
        let primary_decision = self.ensemble.evaluate(primary);
        let entry_decision = self.ensemble.evaluate(entry);
        let alignment = align(
            primary_decision.as_reading(),
            entry_decision.as_reading(),
            self.profile.alignment,
        );
        debug!(
            symbol,
            primary = %primary_decision.direction,
            entry = %entry_decision.direction,
            aligned = %alignment.direction,
            strength = alignment.strength,
            reason = alignment.reason,
            "Signal evaluated"
        );
        SignalSnapshot {
            symbol: symbol.to_string(),
            time,
            primary: primary_decision,
            entry: entry_decision,
            alignment,
        }
    }

    // ==================== Entries ====================

    /// Turn a signal into a sized, bracketed entry, or explain why not.
    pub fn plan_entry(
        &self,
        signal: &SignalSnapshot,
        price: Decimal,
        atr: Option<Decimal>,
        capital: Decimal,
        quantization: &SymbolQuantization,
    ) -> Result<EntryPlan, SkipReason> {
        let alignment = &signal.alignment;
        let Some(side) = alignment.direction.side() else {
            return Err(SkipReason::NoSignal(alignment.reason));
        };
        let gate = &self.profile.entry_gate;
        let strength = alignment.strength;
        let tier = if strength >= gate.full {
            EntryTier::Full
        } else if strength >= gate.partial {
            EntryTier::Partial
        } else {
            return Err(SkipReason::BelowEntryGate(strength));
        };

        if self.positions.contains_key(&signal.symbol) {
            return Err(SkipReason::AlreadyOpen);
        }
        if let Some(last) = self.last_entry.get(&signal.symbol) {
            if (signal.time - *last).num_seconds() < self.profile.signal_cooldown_secs {
                return Err(SkipReason::Cooldown);
            }
        }
        let validation = self.guard.can_open(self.open_count());
        if !validation.allowed {
            return Err(SkipReason::Guard(validation.reason));
        }

        let risk = &self.profile.risk;
        let stop_loss = stops::stop_loss(price, side, atr, &risk.stop_loss);
        let take_profit = stops::take_profit(price, side, stop_loss, &risk.take_profit);

        let sizer = PositionSizer::new(risk);
        let mut quantity = sizer
            .size(capital, price, stop_loss, strength, quantization)
            .map_err(SkipReason::Sizing)?;
        if tier == EntryTier::Partial {
            quantity = quantization.round_qty_down(quantity * gate.partial_size);
            if quantity * price < risk.min_position_usd {
                return Err(SkipReason::Sizing(SizingRejection::BelowMinValue {
                    value: quantity * price,
                    min_value: risk.min_position_usd,
                }));
            }
        }
        quantization
            .validate_order(quantity, quantization.round_price(price))
            .map_err(SkipReason::Filters)?;

        let metrics = RiskMetrics::new(price, stop_loss, take_profit, quantity, side);
        metrics
            .check(risk.min_risk_reward)
            .map_err(SkipReason::RiskReward)?;

        Ok(EntryPlan {
            symbol: signal.symbol.clone(),
            side,
            price,
            quantity,
            stop_loss,
            take_profit,
            strength,
            tier,
            atr,
            risk: metrics,
        })
    }

    /// Record a filled entry. Brackets are recomputed around the fill price.
    pub fn open_position(
        &mut self,
        plan: &EntryPlan,
        fill: &OrderFill,
        time: DateTime<Utc>,
        quantization: &SymbolQuantization,
    ) -> Result<&Position, PositionError> {
        let risk = &self.profile.risk;
        let stop_loss = stops::stop_loss(fill.avg_price, plan.side, plan.atr, &risk.stop_loss);
        let take_profit =
            stops::take_profit(fill.avg_price, plan.side, stop_loss, &risk.take_profit);
        let position = Position::open(OpenRequest {
            symbol: plan.symbol.clone(),
            side: plan.side,
            entry_price: fill.avg_price,
            quantity: fill.filled_quantity,
            stop_loss,
            take_profit,
            ladder: risk.ladder.clone(),
            trailing_enabled: risk.trailing.enabled,
            signal_strength: plan.strength,
            entry_time: time,
            entry_order_id: Some(fill.order_id.clone()),
            quantity_step: quantization.step_size,
            min_qty: quantization.min_qty,
            min_notional: quantization.min_notional,
        })?;
        info!(
            symbol = %position.symbol,
            side = %position.side,
            entry = %position.entry_price,
            quantity = %position.initial_quantity,
            stop = %position.stop_loss,
            target = %position.take_profit,
            strength = plan.strength,
            "Position opened"
        );
        let symbol = position.symbol.clone();
        self.last_entry.insert(symbol.clone(), time);
        Ok(self.positions.entry(symbol).or_insert(position))
    }

    // ==================== Management ====================

    /// Advance the open position on `symbol` by one observation.
    pub fn manage(
        &mut self,
        symbol: &str,
        obs: &PriceObservation,
        atr: Option<Decimal>,
    ) -> Result<ManageOutcome, PositionError> {
        let mut outcome = ManageOutcome::default();
        let Some(position) = self.positions.get_mut(symbol) else {
            return Ok(outcome);
        };
        let events = lifecycle::advance(position, obs, atr, &self.profile.risk)?;
        for event in &events {
            self.guard.record_realized(event.realized());
        }
        if !position.is_open() {
            if let Some(closed) = self.positions.remove(symbol) {
                outcome.closed.push(closed);
            }
        }
        outcome.events = events;
        Ok(outcome)
    }

    /// Flatten the position on `symbol` at `price`.
    pub fn close_position(
        &mut self,
        symbol: &str,
        price: Decimal,
        time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Option<(PositionEvent, Position)>, PositionError> {
        let Some(mut position) = self.positions.remove(symbol) else {
            return Ok(None);
        };
        let event = lifecycle::force_close(&mut position, price, time, reason, &self.profile.risk)?;
        self.guard.record_realized(event.realized());
        Ok(Some((event, position)))
    }

    /// Drop a position without trading it (reconciliation).
    pub fn forget_position(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    // ==================== Portfolio ====================

    pub fn update_equity(&mut self, equity: Decimal, now: DateTime<Utc>) {
        self.guard.update_equity(equity, now);
    }

    pub fn circuit_breaker(&self) -> Option<String> {
        self.guard.circuit_breaker_tripped()
    }

    /// Unrealized PnL of every open position at the given marks.
    pub fn unrealized_pnl(&self, marks: &BTreeMap<String, Decimal>) -> Decimal {
        self.positions
            .values()
            .filter_map(|p| marks.get(&p.symbol).map(|m| p.unrealized_pnl(*m)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::candle::make_candles;
    use crate::models::{Direction, Timeframe};
    use crate::trading::AlignmentMode;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn engine() -> Engine {
        Engine::new(Profile::swing()).unwrap()
    }

    fn signal(direction: Direction, strength: f64) -> SignalSnapshot {
        let e = engine();
        let candles = make_candles(&[100.0; 10], Timeframe::H1);
        let mut s = e.decide("BTCUSDT", t0(), &candles, &candles);
        s.alignment.direction = direction;
        s.alignment.strength = strength;
        s
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn fill(plan: &EntryPlan) -> OrderFill {
        OrderFill {
            order_id: "1".to_string(),
            client_order_id: "c1".to_string(),
            filled_quantity: plan.quantity,
            avg_price: plan.price,
            commission: Decimal::ZERO,
        }
    }

    #[test]
    fn test_short_history_holds() {
        let e = engine();
        let candles = make_candles(&[100.0; 30], Timeframe::H1);
        let s = e.decide("BTCUSDT", t0(), &candles, &candles);
        assert_eq!(s.alignment.direction, Direction::Hold);
        assert!(matches!(
            e.plan_entry(&s, dec!(100), None, dec!(10000), &SymbolQuantization::default()),
            Err(SkipReason::NoSignal(_))
        ));
    }

    #[test]
    fn test_strict_alignment_without_primary_trend() {
        let e = engine();
        assert_eq!(e.profile().alignment, AlignmentMode::Strict);
        let a = align((Direction::Hold, 0.0), (Direction::Buy, 0.9), e.profile().alignment);
        assert_eq!(a.direction, Direction::Hold);
        assert_eq!(a.reason, "No primary trend");
    }

    #[test]
    fn test_entry_gate_tiers() {
        let mut e = engine();
        e.update_equity(dec!(10000), t0());
        let q = SymbolQuantization::default();

        let weak = e.plan_entry(&signal(Direction::Buy, 0.2), dec!(100), None, dec!(10000), &q);
        assert!(matches!(weak, Err(SkipReason::BelowEntryGate(_))));

        let full = e
            .plan_entry(&signal(Direction::Buy, 0.6), dec!(100), None, dec!(10000), &q)
            .unwrap();
        let partial = e
            .plan_entry(&signal(Direction::Buy, 0.35), dec!(100), None, dec!(10000), &q)
            .unwrap();
        assert_eq!(full.tier, EntryTier::Full);
        assert_eq!(partial.tier, EntryTier::Partial);
        assert!(partial.quantity < full.quantity);
        assert_eq!(full.stop_loss, dec!(97.5));
        assert_eq!(full.take_profit, dec!(104));
    }

    #[test]
    fn test_one_position_per_symbol() {
        let mut e = engine();
        e.update_equity(dec!(10000), t0());
        let q = SymbolQuantization::default();
        let sig = signal(Direction::Buy, 0.7);
        let plan = e.plan_entry(&sig, dec!(100), None, dec!(10000), &q).unwrap();
        e.open_position(&plan, &fill(&plan), t0(), &q).unwrap();

        assert_eq!(
            e.plan_entry(&sig, dec!(100), None, dec!(10000), &q),
            Err(SkipReason::AlreadyOpen)
        );
    }

    #[test]
    fn test_guard_blocks_entry() {
        let mut e = engine();
        e.update_equity(dec!(10000), t0());
        e.update_equity(dec!(8000), t0());
        let plan = e.plan_entry(
            &signal(Direction::Buy, 0.9),
            dec!(100),
            None,
            dec!(8000),
            &SymbolQuantization::default(),
        );
        match plan {
            Err(SkipReason::Guard(reason)) => assert!(reason.starts_with("Max drawdown exceeded")),
            other => panic!("expected guard denial, got {:?}", other),
        }
    }

    #[test]
    fn test_min_risk_reward_rejects() {
        let mut profile = Profile::swing();
        profile.risk.min_risk_reward = Some(dec!(2));
        let mut e = Engine::new(profile).unwrap();
        e.update_equity(dec!(10000), t0());
        // 2.5% stop vs 4% target is 1.6
        let plan = e.plan_entry(
            &signal(Direction::Sell, 0.9),
            dec!(100),
            None,
            dec!(10000),
            &SymbolQuantization::default(),
        );
        assert!(matches!(plan, Err(SkipReason::RiskReward(_))));
    }

    #[test]
    fn test_manage_feeds_guard_and_removes_closed() {
        let mut e = engine();
        e.update_equity(dec!(10000), t0());
        let q = SymbolQuantization::default();
        let plan = e
            .plan_entry(&signal(Direction::Buy, 0.7), dec!(100), None, dec!(10000), &q)
            .unwrap();
        e.open_position(&plan, &fill(&plan), t0(), &q).unwrap();

        let obs = PriceObservation {
            time: t0(),
            high: dec!(101),
            low: dec!(90),
            close: dec!(90),
        };
        let outcome = e.manage("BTCUSDT", &obs, None).unwrap();
        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(e.open_count(), 0);
        assert!(e.guard().state().daily_pnl < Decimal::ZERO);
        assert_eq!(e.guard().state().daily_pnl, outcome.closed[0].realized_pnl);
    }

    #[test]
    fn test_restore_keeps_open_positions() {
        let mut e = engine();
        e.update_equity(dec!(10000), t0());
        let q = SymbolQuantization::default();
        let plan = e
            .plan_entry(&signal(Direction::Buy, 0.7), dec!(100), None, dec!(10000), &q)
            .unwrap();
        let position = e.open_position(&plan, &fill(&plan), t0(), &q).unwrap().clone();

        let restored =
            Engine::restore(Profile::swing(), e.guard().state().clone(), vec![position.clone()])
                .unwrap();
        assert_eq!(restored.position("BTCUSDT"), Some(&position));
        assert_eq!(restored.guard().state(), e.guard().state());
    }

    #[test]
    fn test_step_evaluates_entry_on_closing_candle() {
        let mut e = engine();
        e.update_equity(dec!(10000), t0());
        let q = SymbolQuantization::default();
        let plan = e
            .plan_entry(&signal(Direction::Buy, 0.7), dec!(100), None, dec!(10000), &q)
            .unwrap();
        e.open_position(&plan, &fill(&plan), t0(), &q).unwrap();

        // The candle that just closed gaps through the 97.5 stop
        let candles = make_candles(&[100.0, 90.0], Timeframe::H1);
        let input = StepInput {
            symbol: "BTCUSDT",
            now: t0() + chrono::Duration::hours(1),
            primary: &candles,
            entry: &candles,
            quantization: &q,
        };
        let step = e
            .step(&input, |_, _, managed| dec!(10000) + managed.realized())
            .unwrap()
            .unwrap();

        assert_eq!(step.managed_side, Some(TradeSide::Buy));
        assert_eq!(step.managed.closed.len(), 1);
        assert_eq!(step.observation.close, dec!(90));
        assert!(step.breaker.is_none());
        assert_eq!(e.guard().state().current_equity, step.equity);
        assert!(step.equity < dec!(10000));
        let decision = step.entry.expect("flat symbol is evaluated on the same candle");
        assert!(matches!(decision.plan, Err(SkipReason::NoSignal(_))));
    }

    #[test]
    fn test_step_holds_entries_while_breaker_tripped() {
        let mut e = engine();
        e.update_equity(dec!(10000), t0());
        let candles = make_candles(&[100.0; 5], Timeframe::H1);
        let q = SymbolQuantization::default();
        let input = StepInput {
            symbol: "ETHUSDT",
            now: t0(),
            primary: &candles,
            entry: &candles,
            quantization: &q,
        };
        let step = e.step(&input, |_, _, _| dec!(8000)).unwrap().unwrap();
        assert!(step.breaker.is_some());
        assert!(step.entry.is_none());

        let empty = StepInput { entry: &[], ..input };
        assert!(e.step(&empty, |_, _, _| dec!(8000)).unwrap().is_none());
    }

    #[test]
    fn test_cooldown_after_entry() {
        let mut e = engine();
        e.update_equity(dec!(10000), t0());
        let q = SymbolQuantization::default();
        let plan = e
            .plan_entry(&signal(Direction::Buy, 0.7), dec!(100), None, dec!(10000), &q)
            .unwrap();
        e.open_position(&plan, &fill(&plan), t0(), &q).unwrap();
        e.close_position("BTCUSDT", dec!(99), t0(), ExitReason::StopLoss)
            .unwrap();

        assert_eq!(
            e.plan_entry(&signal(Direction::Buy, 0.7), dec!(100), None, dec!(10000), &q),
            Err(SkipReason::Cooldown)
        );
        let mut later = signal(Direction::Buy, 0.7);
        later.time = t0() + chrono::Duration::seconds(e.profile().signal_cooldown_secs);
        assert!(e.plan_entry(&later, dec!(100), None, dec!(10000), &q).is_ok());
    }
}
