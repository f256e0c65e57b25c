//! Position model: one bracketed holding with a partial take-profit ladder.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::market::round_down_to;
use super::TradeSide;

/// Remaining quantity at or below this is treated as fully closed.
pub const DUST_QUANTITY: Decimal = dec!(0.0001);

/// One rung of the take-profit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderStep {
    /// Fraction of the entry-to-target distance (1.0 = the target itself)
    pub price_fraction: Decimal,

    /// Fraction of the initial quantity closed at this rung
    pub quantity_fraction: Decimal,
}

impl LadderStep {
    pub const fn new(price_fraction: Decimal, quantity_fraction: Decimal) -> Self {
        Self {
            price_fraction,
            quantity_fraction,
        }
    }
}

/// A ladder rung resolved to a concrete trigger price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    /// 1-based rung number
    pub level: u8,
    pub trigger_price: Decimal,
    pub quantity_fraction: Decimal,
    pub hit: bool,
}

impl TakeProfitLevel {
    pub fn is_reached(&self, side: TradeSide, price: Decimal) -> bool {
        match side {
            TradeSide::Buy => price >= self.trigger_price,
            TradeSide::Sell => price <= self.trigger_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfitLadder,
    StopLoss,
    TakeProfit,
    CircuitBreaker,
    /// Closed at startup because no matching live order was found
    Reconciled,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfitLadder => "take-profit ladder complete",
            ExitReason::StopLoss => "stop-loss",
            ExitReason::TakeProfit => "take-profit",
            ExitReason::CircuitBreaker => "circuit breaker",
            ExitReason::Reconciled => "reconciled: no live order found",
            ExitReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exit fill in the position ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialExit {
    pub time: DateTime<Utc>,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Net of entry and exit fees on this slice
    pub pnl: Decimal,
    pub fee: Decimal,
    /// Ladder rung, or `None` for a stop/target/forced close of the remainder
    pub level: Option<u8>,
}

#[derive(Debug, Error, PartialEq)]
pub enum PositionError {
    #[error("stop {stop} and target {target} do not straddle entry {entry} for a {side} position")]
    InvalidBracket {
        side: TradeSide,
        entry: Decimal,
        stop: Decimal,
        target: Decimal,
    },

    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),

    #[error("entry price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("position {0} is already closed")]
    AlreadyClosed(String),

    #[error("ladder level {0} does not exist or was already hit")]
    UnknownLevel(u8),
}

/// Everything needed to open a position.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub ladder: Vec<LadderStep>,
    pub trailing_enabled: bool,
    pub signal_strength: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_order_id: Option<String>,
    /// Exchange quantity increment used to size ladder slices
    pub quantity_step: Decimal,
    /// Exchange order floors a ladder slice must clear
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

/// A held position and its exit ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// `{symbol}-{entry millis}`, stable across replays
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: Decimal,
    pub initial_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub tp_levels: Vec<TakeProfitLevel>,
    pub trailing_enabled: bool,
    pub status: PositionStatus,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Decimal,
    pub pnl_pct: Decimal,
    pub fees: Decimal,
    pub partial_exits: Vec<PartialExit>,
    pub signal_strength: f64,
    #[serde(default)]
    pub entry_order_id: Option<String>,
    #[serde(default)]
    pub quantity_step: Decimal,
    #[serde(default)]
    pub min_qty: Decimal,
    #[serde(default)]
    pub min_notional: Decimal,
}

impl Position {
    /// Open a position, resolving ladder rungs into trigger prices.
    pub fn open(req: OpenRequest) -> Result<Self, PositionError> {
        if req.entry_price <= Decimal::ZERO {
            return Err(PositionError::NonPositivePrice(req.entry_price));
        }
        if req.quantity <= Decimal::ZERO {
            return Err(PositionError::NonPositiveQuantity(req.quantity));
        }
        let straddles = match req.side {
            TradeSide::Buy => req.stop_loss < req.entry_price && req.entry_price < req.take_profit,
            TradeSide::Sell => req.stop_loss > req.entry_price && req.entry_price > req.take_profit,
        };
        if !straddles {
            return Err(PositionError::InvalidBracket {
                side: req.side,
                entry: req.entry_price,
                stop: req.stop_loss,
                target: req.take_profit,
            });
        }

        let distance = req.take_profit - req.entry_price;
        let tp_levels = req
            .ladder
            .iter()
            .enumerate()
            .map(|(i, step)| TakeProfitLevel {
                level: (i + 1) as u8,
                trigger_price: req.entry_price + distance * step.price_fraction,
                quantity_fraction: step.quantity_fraction,
                hit: false,
            })
            .collect();

        Ok(Self {
            id: format!("{}-{}", req.symbol, req.entry_time.timestamp_millis()),
            symbol: req.symbol,
            side: req.side,
            entry_price: req.entry_price,
            initial_quantity: req.quantity,
            remaining_quantity: req.quantity,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            tp_levels,
            trailing_enabled: req.trailing_enabled,
            status: PositionStatus::Open,
            entry_time: req.entry_time,
            exit_time: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: Decimal::ZERO,
            pnl_pct: Decimal::ZERO,
            fees: Decimal::ZERO,
            partial_exits: Vec::new(),
            signal_strength: req.signal_strength,
            entry_order_id: req.entry_order_id,
            quantity_step: req.quantity_step,
            min_qty: req.min_qty,
            min_notional: req.min_notional,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn entry_notional(&self) -> Decimal {
        self.entry_price * self.initial_quantity
    }

    /// Sum of every exit fill so far.
    pub fn exited_quantity(&self) -> Decimal {
        self.partial_exits.iter().map(|e| e.quantity).sum()
    }

    /// First ladder rung not yet hit.
    pub fn next_level(&self) -> Option<&TakeProfitLevel> {
        self.tp_levels.iter().find(|l| !l.hit)
    }

    pub fn has_ladder(&self) -> bool {
        !self.tp_levels.is_empty()
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.side
            .gross_pnl(self.entry_price, price, self.remaining_quantity)
    }

    pub fn stop_breached(&self, low: Decimal, high: Decimal) -> bool {
        match self.side {
            TradeSide::Buy => low <= self.stop_loss,
            TradeSide::Sell => high >= self.stop_loss,
        }
    }

    pub fn target_breached(&self, low: Decimal, high: Decimal) -> bool {
        match self.side {
            TradeSide::Buy => high >= self.take_profit,
            TradeSide::Sell => low <= self.take_profit,
        }
    }

    /// Close the rung `level` at `price`.
    ///
    /// The slice is the rung's fraction of the initial size, rounded down to the
    /// quantity step. The last rung, or a slice that would leave dust or an
    /// untradable remainder, takes everything that remains. A slice the
    /// exchange would reject is not traded: its fraction moves to the next
    /// rung and `None` is returned.
    pub fn take_partial(
        &mut self,
        level: u8,
        price: Decimal,
        time: DateTime<Utc>,
        fee_rate: Decimal,
    ) -> Result<Option<PartialExit>, PositionError> {
        if !self.is_open() {
            return Err(PositionError::AlreadyClosed(self.id.clone()));
        }
        let Some(index) = self.tp_levels.iter().position(|l| l.level == level && !l.hit) else {
            return Err(PositionError::UnknownLevel(level));
        };
        let is_last = index + 1 == self.tp_levels.len();
        let fraction = self.tp_levels[index].quantity_fraction;
        self.tp_levels[index].hit = true;

        let mut quantity =
            round_down_to(self.initial_quantity * fraction, self.quantity_step).min(self.remaining_quantity);
        if !is_last && !self.is_tradable(quantity, price) {
            self.tp_levels[index + 1].quantity_fraction += fraction;
            return Ok(None);
        }
        let leftover = self.remaining_quantity - quantity;
        if is_last || leftover <= DUST_QUANTITY || !self.is_tradable(leftover, price) {
            quantity = self.remaining_quantity;
        }

        let exit = self.record_exit(quantity, price, time, fee_rate, Some(level));
        if self.remaining_quantity <= DUST_QUANTITY {
            self.finish(price, time, ExitReason::TakeProfitLadder);
        }
        Ok(Some(exit))
    }

    /// Whether the exchange would accept a market order of `quantity` at `price`.
    fn is_tradable(&self, quantity: Decimal, price: Decimal) -> bool {
        quantity > Decimal::ZERO && quantity >= self.min_qty && quantity * price >= self.min_notional
    }

    /// Close everything that remains at `price` (already slippage adjusted).
    pub fn close(
        &mut self,
        price: Decimal,
        time: DateTime<Utc>,
        reason: ExitReason,
        fee_rate: Decimal,
    ) -> Result<PartialExit, PositionError> {
        if !self.is_open() {
            return Err(PositionError::AlreadyClosed(self.id.clone()));
        }
        let exit = self.record_exit(self.remaining_quantity, price, time, fee_rate, None);
        self.finish(price, time, reason);
        Ok(exit)
    }

    /// Move the stop to `candidate` if that tightens it. Returns the old stop.
    pub fn ratchet_stop(&mut self, candidate: Decimal) -> Option<Decimal> {
        let tighter = match self.side {
            TradeSide::Buy => candidate > self.stop_loss,
            TradeSide::Sell => candidate < self.stop_loss,
        };
        if !self.is_open() || !tighter {
            return None;
        }
        let old = self.stop_loss;
        self.stop_loss = candidate;
        Some(old)
    }

    fn record_exit(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        time: DateTime<Utc>,
        fee_rate: Decimal,
        level: Option<u8>,
    ) -> PartialExit {
        let fee = (self.entry_price * quantity + price * quantity) * fee_rate;
        let pnl = self.side.gross_pnl(self.entry_price, price, quantity) - fee;
        let exit = PartialExit {
            time,
            price,
            quantity,
            pnl,
            fee,
            level,
        };
        self.remaining_quantity -= quantity;
        self.realized_pnl += pnl;
        self.fees += fee;
        self.partial_exits.push(exit.clone());
        exit
    }

    fn finish(&mut self, price: Decimal, time: DateTime<Utc>, reason: ExitReason) {
        self.status = PositionStatus::Closed;
        self.exit_time = Some(time);
        self.exit_price = Some(price);
        self.exit_reason = Some(reason);
        let notional = self.entry_notional();
        if !notional.is_zero() {
            self.pnl_pct = self.realized_pnl / notional * dec!(100);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ladder() -> Vec<LadderStep> {
        vec![
            LadderStep::new(dec!(0.5), dec!(0.3)),
            LadderStep::new(dec!(0.75), dec!(0.4)),
            LadderStep::new(dec!(1.0), dec!(0.3)),
        ]
    }

    fn request(side: TradeSide, stop: Decimal, target: Decimal) -> OpenRequest {
        OpenRequest {
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: dec!(100),
            quantity: dec!(10),
            stop_loss: stop,
            take_profit: target,
            ladder: ladder(),
            trailing_enabled: false,
            signal_strength: 0.7,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            entry_order_id: None,
            quantity_step: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: Decimal::ZERO,
        }
    }

    fn conserved(p: &Position) -> bool {
        p.remaining_quantity + p.exited_quantity() == p.initial_quantity
    }

    #[test]
    fn test_ladder_trigger_prices() {
        let p = Position::open(request(TradeSide::Buy, dec!(95), dec!(110))).unwrap();
        let triggers: Vec<_> = p.tp_levels.iter().map(|l| l.trigger_price).collect();
        assert_eq!(triggers, vec![dec!(105), dec!(107.5), dec!(110)]);
        let fractions: Vec<_> = p.tp_levels.iter().map(|l| l.quantity_fraction).collect();
        assert_eq!(fractions, vec![dec!(0.3), dec!(0.4), dec!(0.3)]);
    }

    #[test]
    fn test_sell_ladder_mirrors() {
        let p = Position::open(request(TradeSide::Sell, dec!(105), dec!(90))).unwrap();
        assert_eq!(p.tp_levels[0].trigger_price, dec!(95));
        assert_eq!(p.tp_levels[2].trigger_price, dec!(90));
        assert!(p.tp_levels[0].is_reached(TradeSide::Sell, dec!(94)));
        assert!(!p.tp_levels[0].is_reached(TradeSide::Sell, dec!(96)));
    }

    #[test]
    fn test_rejects_bad_bracket() {
        let err = Position::open(request(TradeSide::Buy, dec!(101), dec!(110))).unwrap_err();
        assert!(matches!(err, PositionError::InvalidBracket { .. }));
        let err = Position::open(request(TradeSide::Sell, dec!(95), dec!(90))).unwrap_err();
        assert!(matches!(err, PositionError::InvalidBracket { .. }));

        let mut req = request(TradeSide::Buy, dec!(95), dec!(110));
        req.quantity = Decimal::ZERO;
        assert_eq!(
            Position::open(req).unwrap_err(),
            PositionError::NonPositiveQuantity(Decimal::ZERO)
        );
    }

    #[test]
    fn test_full_ladder_conserves_quantity() {
        let mut p = Position::open(request(TradeSide::Buy, dec!(95), dec!(110))).unwrap();
        let t = p.entry_time;

        let e1 = p.take_partial(1, dec!(105), t, dec!(0.001)).unwrap().unwrap();
        assert_eq!(e1.quantity, dec!(3));
        assert!(conserved(&p));
        assert!(p.is_open());

        let e2 = p.take_partial(2, dec!(107.5), t, dec!(0.001)).unwrap().unwrap();
        assert_eq!(e2.quantity, dec!(4));
        assert!(conserved(&p));

        let e3 = p.take_partial(3, dec!(110), t, dec!(0.001)).unwrap().unwrap();
        assert_eq!(e3.quantity, dec!(3));
        assert!(conserved(&p));
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.exit_reason, Some(ExitReason::TakeProfitLadder));
        assert_eq!(p.remaining_quantity, Decimal::ZERO);

        // 3*5 + 4*7.5 + 3*10 = 75 gross
        let gross = dec!(75);
        assert_eq!(p.realized_pnl, gross - p.fees);
        assert!(p.pnl_pct > Decimal::ZERO);
    }

    #[test]
    fn test_slice_fee_covers_both_legs() {
        let mut p = Position::open(request(TradeSide::Buy, dec!(95), dec!(110))).unwrap();
        let exit = p
            .take_partial(1, dec!(105), p.entry_time, dec!(0.001))
            .unwrap()
            .unwrap();
        // (100*3 + 105*3) * 0.001
        assert_eq!(exit.fee, dec!(0.615));
        assert_eq!(exit.pnl, dec!(15) - dec!(0.615));
    }

    #[test]
    fn test_stop_close_after_partial() {
        let mut p = Position::open(request(TradeSide::Buy, dec!(95), dec!(110))).unwrap();
        let t = p.entry_time;
        p.take_partial(1, dec!(105), t, Decimal::ZERO).unwrap();
        let exit = p.close(dec!(99.9), t, ExitReason::StopLoss, Decimal::ZERO).unwrap();
        assert_eq!(exit.quantity, dec!(7));
        assert_eq!(exit.level, None);
        assert!(conserved(&p));
        assert_eq!(p.status, PositionStatus::Closed);

        // Closed positions never reopen or trade again
        assert!(p.close(dec!(100), t, ExitReason::Manual, Decimal::ZERO).is_err());
        assert!(p.take_partial(2, dec!(108), t, Decimal::ZERO).is_err());
        assert_eq!(p.status, PositionStatus::Closed);
    }

    #[test]
    fn test_dust_folds_into_slice() {
        let mut req = request(TradeSide::Buy, dec!(95), dec!(110));
        req.quantity = dec!(0.0011);
        req.quantity_step = dec!(0.0001);
        req.min_qty = dec!(0.0001);
        req.ladder = vec![
            LadderStep::new(dec!(0.5), dec!(0.95)),
            LadderStep::new(dec!(1.0), dec!(0.05)),
        ];
        let mut p = Position::open(req).unwrap();
        let exit = p.take_partial(1, dec!(105), p.entry_time, Decimal::ZERO).unwrap().unwrap();
        // 0.001045 rounds to 0.001 and would leave 0.0001 of dust
        assert_eq!(exit.quantity, dec!(0.0011));
        assert_eq!(p.status, PositionStatus::Closed);
        assert!(conserved(&p));
    }

    fn minimum_size(min_notional: Decimal) -> Position {
        let mut req = request(TradeSide::Buy, dec!(9500), dec!(11000));
        req.entry_price = dec!(10000);
        req.quantity = dec!(0.002);
        req.min_notional = min_notional;
        Position::open(req).unwrap()
    }

    #[test]
    fn test_zero_slice_folds_into_next_rung() {
        let mut p = minimum_size(dec!(10));
        let t = p.entry_time;

        // 30% of 0.002 rounds down to nothing
        assert_eq!(p.take_partial(1, dec!(10500), t, Decimal::ZERO).unwrap(), None);
        assert!(p.partial_exits.is_empty());
        assert_eq!(p.remaining_quantity, dec!(0.002));
        assert!(p.tp_levels[0].hit);
        assert_eq!(p.tp_levels[1].quantity_fraction, dec!(0.7));

        let e2 = p.take_partial(2, dec!(10750), t, Decimal::ZERO).unwrap().unwrap();
        assert_eq!(e2.quantity, dec!(0.001));
        let e3 = p.take_partial(3, dec!(11000), t, Decimal::ZERO).unwrap().unwrap();
        assert_eq!(e3.quantity, dec!(0.001));
        assert_eq!(p.status, PositionStatus::Closed);
        assert!(conserved(&p));
        assert!(p.partial_exits.iter().all(|e| e.quantity >= p.min_qty));
    }

    #[test]
    fn test_slice_under_min_notional_folds_to_last_rung() {
        let mut p = minimum_size(dec!(15));
        let t = p.entry_time;
        assert_eq!(p.take_partial(1, dec!(10500), t, Decimal::ZERO).unwrap(), None);
        // 0.001 * 10750 is under the 15 floor
        assert_eq!(p.take_partial(2, dec!(10750), t, Decimal::ZERO).unwrap(), None);
        assert_eq!(p.tp_levels[2].quantity_fraction, dec!(1.0));

        let last = p.take_partial(3, dec!(11000), t, Decimal::ZERO).unwrap().unwrap();
        assert_eq!(last.quantity, dec!(0.002));
        assert_eq!(p.partial_exits.len(), 1);
        assert_eq!(p.exit_reason, Some(ExitReason::TakeProfitLadder));
        assert!(conserved(&p));
    }

    #[test]
    fn test_ratchet_only_tightens() {
        let mut p = Position::open(request(TradeSide::Buy, dec!(95), dec!(110))).unwrap();
        assert_eq!(p.ratchet_stop(dec!(94)), None);
        assert_eq!(p.ratchet_stop(dec!(97)), Some(dec!(95)));
        assert_eq!(p.stop_loss, dec!(97));

        let mut s = Position::open(request(TradeSide::Sell, dec!(105), dec!(90))).unwrap();
        assert_eq!(s.ratchet_stop(dec!(106)), None);
        assert_eq!(s.ratchet_stop(dec!(103)), Some(dec!(105)));
    }

    #[test]
    fn test_deterministic_id() {
        let p = Position::open(request(TradeSide::Buy, dec!(95), dec!(110))).unwrap();
        assert_eq!(p.id, "BTCUSDT-1704067200000");
    }
}
