//! Live driver: candle-paced loop around the engine with persistence.
//!
//! Handles:
//! - Sleeping to the next entry candle boundary, then one tick
//! - One engine step per symbol on the candle that just closed
//! - Placing the entry and exit orders that step asks for
//! - Circuit breaker policy and graceful shutdown
//! - Reconciling stored positions at startup

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::api::candles::is_stale;
use crate::api::ExchangeGateway;
use crate::db::Database;
use crate::engine::{Engine, EntryDecision, SkipReason, StepInput};
use crate::models::{ExitReason, Position, TradeSide};
use crate::notify::{NotificationEvent, Notifier, NotifierConfig};
use crate::trading::{BreakerPolicy, PositionEvent, Profile};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub profile: Profile,

    /// Paper fills instead of real orders
    pub dry_run: bool,

    /// Starting cash for the paper gateway
    pub paper_capital: Decimal,

    /// Database URL
    pub database_url: String,

    pub notifier: NotifierConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            profile: Profile::swing(),
            dry_run: true,
            paper_capital: dec!(10000),
            database_url: "sqlite:ensemble.db?mode=rwc".to_string(),
            notifier: NotifierConfig::default(),
        }
    }
}

/// How a tick ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Circuit breaker tripped; the loop should stop
    Halt(String),
}

/// Main bot runner.
pub struct Bot<G> {
    config: BotConfig,
    gateway: G,
    engine: Engine,
    db: Database,
    notifier: Notifier,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl<G: ExchangeGateway> Bot<G> {
    /// Create a bot, restoring guard state and open positions from the database.
    pub async fn new(config: BotConfig, gateway: G) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let notifier = Notifier::new(config.notifier.clone())?;

        let risk_state = match db.find_bot_state().await? {
            Some(state) => state.risk_state()?,
            None => Default::default(),
        };
        let open = db.get_open_positions().await?;
        if !open.is_empty() {
            info!(positions = open.len(), "Restoring open positions");
        }
        let engine = Engine::restore(config.profile.clone(), risk_state, open)?;
        db.init_bot_state(&config.profile.kind.to_string(), Utc::now())
            .await?;

        Ok(Self {
            config,
            gateway,
            engine,
            db,
            notifier,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // ==================== Run Loop ====================

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        let profile = &self.config.profile;
        info!(
            profile = %profile.kind,
            dry_run = self.config.dry_run,
            entry_tf = %profile.entry_timeframe,
            primary_tf = %profile.primary_timeframe,
            "Starting bot run loop"
        );
        self.notifier
            .notify(NotificationEvent::BotStarted {
                profile: profile.kind.to_string(),
                mode: if self.config.dry_run { "dry-run" } else { "live" }.to_string(),
                symbols: profile.symbols.clone(),
            })
            .await;

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.reconcile(Utc::now()).await;

        let mut stop_reason = "shutdown requested".to_string();
        while !self.shutdown.load(Ordering::SeqCst) {
            if !self.sleep_to_next_candle().await {
                break;
            }

            match self.tick(Utc::now()).await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Halt(reason)) => {
                    stop_reason = format!("circuit breaker: {}", reason);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Error in bot tick");
                    self.notifier
                        .notify(NotificationEvent::Error {
                            context: "tick".to_string(),
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        // Graceful shutdown
        self.stop(&stop_reason).await
    }

    /// Sleep until the next entry candle closes plus the buffer. Returns
    /// false when shutdown was requested while waiting.
    async fn sleep_to_next_candle(&self) -> bool {
        let profile = &self.config.profile;
        let now = Utc::now();
        let wake = profile.entry_timeframe.next_boundary(now)
            + chrono::Duration::seconds(profile.candle_wait_buffer_secs);
        debug!(wake = %wake, "Waiting for next candle");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let remaining = wake - Utc::now();
            let Ok(remaining) = remaining.to_std() else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
        }
    }

    /// Persist a final snapshot and release resources.
    async fn stop(&mut self, reason: &str) -> Result<()> {
        info!(reason, "Shutting down bot...");
        let now = Utc::now();
        self.db
            .save_snapshot(self.engine.guard().state(), now)
            .await
            .context("Failed to save final snapshot")?;
        self.db.mark_bot_stopped(now).await?;
        self.notifier
            .notify(NotificationEvent::BotStopped {
                reason: reason.to_string(),
            })
            .await;
        self.db.close().await;
        info!(open_positions = self.engine.open_count(), "Bot stopped");
        Ok(())
    }

    // ==================== Tick ====================

    /// Single iteration: equity, breaker, then every symbol.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        debug!("Bot tick");

        // 1. Equity and guard bookkeeping
        let equity = self
            .gateway
            .get_equity()
            .await
            .context("Failed to fetch equity")?;
        self.engine.update_equity(equity, now);

        // 2. Circuit breaker
        if let Some(reason) = self.engine.circuit_breaker() {
            self.trip_breaker(&reason, now).await?;
            return Ok(TickOutcome::Halt(reason));
        }

        // 3. Symbols
        let symbols = self.config.profile.symbols.clone();
        let mut marks = BTreeMap::new();
        for symbol in &symbols {
            let span = info_span!("symbol", component = "live", symbol = %symbol);
            match self.process_symbol(symbol, equity, now).instrument(span).await {
                Ok(Some(price)) => {
                    marks.insert(symbol.clone(), price);
                }
                Ok(None) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "Symbol skipped this tick"),
            }

            // Losses realized this tick can trip the breaker mid-way
            if let Some(reason) = self.engine.circuit_breaker() {
                self.trip_breaker(&reason, now).await?;
                return Ok(TickOutcome::Halt(reason));
            }
        }

        // 4. Equity curve and snapshot
        let unrealized = self.engine.unrealized_pnl(&marks);
        self.db
            .record_equity_point(
                now,
                equity,
                unrealized,
                self.engine.guard().state().daily_pnl,
                self.engine.open_count(),
            )
            .await?;
        self.db.save_snapshot(self.engine.guard().state(), now).await?;

        Ok(TickOutcome::Continue)
    }

    /// One engine step for a symbol on its last closed entry candle, then
    /// the resulting trades. Returns the close used as the mark, if any.
    async fn process_symbol(
        &mut self,
        symbol: &str,
        equity: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        let profile = &self.config.profile;
        let limit = profile.candle_limit.max(self.engine.required_history());
        let (entry, primary) = futures::try_join!(
            self.gateway.get_candles(symbol, profile.entry_timeframe, limit),
            self.gateway.get_candles(symbol, profile.primary_timeframe, limit),
        )?;
        if is_stale(&entry, profile.entry_timeframe, now, profile.stale_after_intervals) {
            warn!("Entry candles are stale");
            return Ok(None);
        }
        if is_stale(&primary, profile.primary_timeframe, now, profile.stale_after_intervals) {
            warn!("Primary candles are stale");
            return Ok(None);
        }
        let quantization = self.gateway.get_quantization(symbol).await?;

        let input = StepInput {
            symbol,
            now,
            primary: &primary,
            entry: &entry,
            quantization: &quantization,
        };
        let Some(step) = self
            .engine
            .step(&input, |_, _, managed| equity + managed.realized())?
        else {
            warn!("Latest entry candle is not usable");
            return Ok(None);
        };
        let price = step.observation.close;
        debug!(close = %price, equity = %step.equity, "Step evaluated");

        if let Some(side) = step.managed_side {
            self.apply_events(symbol, side, &step.managed.events, &step.managed.closed)
                .await?;
        }
        if step.breaker.is_some() {
            return Ok(Some(price));
        }

        let Some(EntryDecision { signal, plan }) = step.entry else {
            return Ok(Some(price));
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(SkipReason::NoSignal(reason)) => {
                debug!(reason, "No entry");
                return Ok(Some(price));
            }
            Err(reason) => {
                info!(
                    direction = %signal.alignment.direction,
                    strength = signal.alignment.strength,
                    reason = %reason,
                    "Entry skipped"
                );
                return Ok(Some(price));
            }
        };

        let fill = self
            .gateway
            .place_order(symbol, plan.side, plan.quantity)
            .await
            .context("Entry order failed")?;
        let position = self
            .engine
            .open_position(&plan, &fill, now, &quantization)?
            .clone();
        self.db.save_position(&position).await?;
        self.notifier
            .notify(NotificationEvent::TradeOpened {
                symbol: symbol.to_string(),
                side: position.side,
                quantity: position.initial_quantity,
                price: position.entry_price,
                stop_loss: position.stop_loss,
                take_profit: position.take_profit,
                strength: plan.strength,
            })
            .await;
        Ok(Some(price))
    }

    /// Trade, persist, and announce the results of a management pass.
    async fn apply_events(
        &self,
        symbol: &str,
        side: TradeSide,
        events: &[PositionEvent],
        closed: &[Position],
    ) -> Result<()> {
        for event in events {
            match event {
                PositionEvent::PartialExit {
                    position_id, exit, ..
                } => {
                    self.send_exit_order(symbol, position_id, side, exit.quantity)
                        .await;
                    self.db.record_partial_exit(position_id, symbol, exit).await?;
                    self.notifier
                        .notify(NotificationEvent::PartialExit {
                            symbol: symbol.to_string(),
                            level: exit.level.unwrap_or_default(),
                            quantity: exit.quantity,
                            price: exit.price,
                            pnl: exit.pnl,
                        })
                        .await;
                }
                PositionEvent::Closed {
                    position_id, exit, ..
                } => {
                    self.send_exit_order(symbol, position_id, side, exit.quantity)
                        .await;
                    self.db.record_partial_exit(position_id, symbol, exit).await?;
                }
                PositionEvent::StopTrailed { from, to, .. } => {
                    debug!(from = %from, to = %to, "Stop trailed");
                }
            }
        }

        if let Some(position) = self.engine.position(symbol) {
            self.db.save_position(position).await?;
        }
        for position in closed {
            self.db.save_position(position).await?;
            self.notifier
                .notify(NotificationEvent::TradeClosed {
                    symbol: position.symbol.clone(),
                    side: position.side,
                    reason: position.exit_reason.unwrap_or(ExitReason::Manual),
                    pnl: position.realized_pnl,
                    pnl_pct: position.pnl_pct,
                })
                .await;
        }
        Ok(())
    }

    /// Flatten `quantity` on the exchange. A failure leaves the local ledger
    /// ahead of the exchange, so it is surfaced loudly.
    async fn send_exit_order(
        &self,
        symbol: &str,
        position_id: &str,
        side: TradeSide,
        quantity: Decimal,
    ) {
        if let Err(e) = self.gateway.place_order(symbol, side.opposite(), quantity).await {
            error!(symbol, position_id, error = %e, "Exit order failed; exchange may diverge from local state");
            self.notifier
                .notify(NotificationEvent::Error {
                    context: format!("exit order {}", symbol),
                    message: e.to_string(),
                })
                .await;
        }
    }

    /// Apply the configured breaker policy and notify.
    async fn trip_breaker(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        warn!(reason, policy = ?self.config.profile.risk.breaker_policy, "Circuit breaker tripped");
        self.notifier
            .notify(NotificationEvent::CircuitBreaker {
                reason: reason.to_string(),
            })
            .await;

        if self.config.profile.risk.breaker_policy == BreakerPolicy::CloseAll {
            let symbols: Vec<String> = self.engine.open_positions().map(|p| p.symbol.clone()).collect();
            for symbol in symbols {
                let price = match self.gateway.get_price(&symbol).await {
                    Ok(price) => price,
                    Err(e) => {
                        error!(symbol = %symbol, error = %e, "No price; position left open");
                        continue;
                    }
                };
                let Some((side, quantity)) = self
                    .engine
                    .position(&symbol)
                    .map(|p| (p.side, p.remaining_quantity))
                else {
                    continue;
                };
                if let Err(e) = self.gateway.place_order(&symbol, side.opposite(), quantity).await {
                    error!(symbol = %symbol, error = %e, "Breaker close failed; position left open");
                    continue;
                }
                if let Some((event, position)) =
                    self.engine
                        .close_position(&symbol, price, now, ExitReason::CircuitBreaker)?
                {
                    if let PositionEvent::Closed { exit, .. } = &event {
                        self.db.record_partial_exit(&position.id, &symbol, exit).await?;
                    }
                    self.db.save_position(&position).await?;
                    self.notifier
                        .notify(NotificationEvent::TradeClosed {
                            symbol: symbol.clone(),
                            side: position.side,
                            reason: ExitReason::CircuitBreaker,
                            pnl: position.realized_pnl,
                            pnl_pct: position.pnl_pct,
                        })
                        .await;
                }
            }
        }

        self.db.save_snapshot(self.engine.guard().state(), now).await?;
        Ok(())
    }

    // ==================== Reconciliation ====================

    /// Close locally any stored position whose entry order is not among the
    /// exchange's open orders. A failed lookup keeps the position.
    pub async fn reconcile(&mut self, now: DateTime<Utc>) {
        let open: Vec<(String, Option<String>)> = self
            .engine
            .open_positions()
            .map(|p| (p.symbol.clone(), p.entry_order_id.clone()))
            .collect();

        for (symbol, order_id) in open {
            let live = match self.gateway.get_open_orders(&symbol).await {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Order lookup failed; keeping stored position");
                    continue;
                }
            };
            let matched = order_id.as_ref().is_some_and(|id| live.contains(id));
            if matched {
                continue;
            }

            let Some(mut position) = self.engine.forget_position(&symbol) else {
                continue;
            };
            let price = self
                .gateway
                .get_price(&symbol)
                .await
                .unwrap_or(position.entry_price);
            warn!(
                symbol = %symbol,
                order_id = ?order_id,
                "Reconciliation heuristic: no live order found, marking position closed locally"
            );
            if let Err(e) = position.close(price, now, ExitReason::Reconciled, Decimal::ZERO) {
                warn!(symbol = %symbol, error = %e, "Could not mark position closed");
                continue;
            }
            if let Err(e) = self.db.save_position(&position).await {
                error!(symbol = %symbol, error = %e, "Failed to persist reconciled position");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GatewayError;
    use crate::backtest::{resample, BacktestConfig, Backtester, SymbolSeries};
    use crate::models::candle::make_candles;
    use crate::models::{Candle, OpenRequest, OrderFill, PartialExit, SymbolQuantization, Timeframe};
    use crate::trading::PortfolioRiskState;
    use chrono::TimeZone;
    use rust_decimal::prelude::FromPrimitive;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// History revealed one entry candle at a time.
    struct Script {
        entry: Vec<Candle>,
        primary: Vec<Candle>,
        entry_tf: Timeframe,
        cursor: AtomicUsize,
    }

    impl Script {
        fn current(&self) -> &Candle {
            &self.entry[self.cursor.load(Ordering::SeqCst)]
        }

        /// Close time of the current entry candle.
        fn now(&self) -> DateTime<Utc> {
            self.current().close_time(self.entry_tf)
        }

        fn close(&self) -> Decimal {
            Decimal::from_f64(self.current().close).unwrap()
        }

        fn window(&self, timeframe: Timeframe, limit: usize) -> Vec<Candle> {
            let now = self.now();
            let source = if timeframe == self.entry_tf {
                &self.entry
            } else {
                &self.primary
            };
            let closed: Vec<Candle> = source
                .iter()
                .filter(|c| c.close_time(timeframe) <= now)
                .copied()
                .collect();
            closed[closed.len().saturating_sub(limit)..].to_vec()
        }
    }

    /// Scripted exchange: fixed price and equity, optional order lookup
    /// failure, and optional candle history.
    struct MockExchange {
        price: Decimal,
        equity: Decimal,
        open_orders: Option<Vec<String>>,
        orders: StdMutex<Vec<(String, TradeSide, Decimal)>>,
        script: Option<Script>,
    }

    impl MockExchange {
        fn new(equity: Decimal, open_orders: Option<Vec<String>>) -> Self {
            Self {
                price: dec!(100),
                equity,
                open_orders,
                orders: StdMutex::new(Vec::new()),
                script: None,
            }
        }

        fn scripted(script: Script) -> Self {
            Self {
                script: Some(script),
                ..Self::new(dec!(10000), Some(vec![]))
            }
        }

        fn price(&self) -> Decimal {
            self.script.as_ref().map_or(self.price, Script::close)
        }
    }

    impl ExchangeGateway for MockExchange {
        async fn get_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, GatewayError> {
            match &self.script {
                Some(script) => Ok(script.window(timeframe, limit)),
                None => Err(GatewayError::InsufficientData {
                    symbol: symbol.to_string(),
                    got: 0,
                    min: 20,
                }),
            }
        }

        async fn get_price(&self, _: &str) -> Result<Decimal, GatewayError> {
            Ok(self.price())
        }

        async fn get_quantization(&self, _: &str) -> Result<SymbolQuantization, GatewayError> {
            Ok(SymbolQuantization::default())
        }

        async fn place_order(&self, symbol: &str, side: TradeSide, quantity: Decimal) -> Result<OrderFill, GatewayError> {
            self.orders.lock().unwrap().push((symbol.to_string(), side, quantity));
            Ok(OrderFill {
                order_id: "7".to_string(),
                client_order_id: "et-test".to_string(),
                filled_quantity: quantity,
                avg_price: self.price(),
                commission: Decimal::ZERO,
            })
        }

        async fn get_equity(&self) -> Result<Decimal, GatewayError> {
            Ok(self.equity)
        }

        async fn get_open_orders(&self, _: &str) -> Result<Vec<String>, GatewayError> {
            self.open_orders
                .clone()
                .ok_or_else(|| GatewayError::Parse("lookup failed".to_string()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 5).unwrap()
    }

    fn stored_position() -> Position {
        Position::open(OpenRequest {
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Buy,
            entry_price: dec!(100),
            quantity: dec!(10),
            stop_loss: dec!(95),
            take_profit: dec!(110),
            ladder: Vec::new(),
            trailing_enabled: false,
            signal_strength: 0.6,
            entry_time: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
            entry_order_id: Some("42".to_string()),
            quantity_step: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: Decimal::ZERO,
        })
        .unwrap()
    }

    /// Seed a fresh database, then start a bot on it.
    async fn bot_with(
        exchange: MockExchange,
        policy: BreakerPolicy,
        peak_equity: Option<Decimal>,
    ) -> Bot<MockExchange> {
        let path = std::env::temp_dir().join(format!("ensemble-bot-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite:{}?mode=rwc", path.display());

        let seed = Database::new(&url).await.unwrap();
        seed.init_bot_state("swing", now()).await.unwrap();
        if let Some(peak) = peak_equity {
            let state = PortfolioRiskState {
                peak_equity: peak,
                current_equity: peak,
                ..Default::default()
            };
            seed.save_snapshot(&state, now()).await.unwrap();
        }
        seed.save_position(&stored_position()).await.unwrap();
        seed.close().await;

        let mut profile = Profile::swing();
        profile.symbols = vec!["BTCUSDT".to_string()];
        profile.risk.breaker_policy = policy;
        let config = BotConfig {
            profile,
            database_url: url,
            ..Default::default()
        };
        Bot::new(config, exchange).await.unwrap()
    }

    async fn fresh_bot(exchange: MockExchange, profile: Profile) -> Bot<MockExchange> {
        let path = std::env::temp_dir().join(format!("ensemble-bot-{}.db", uuid::Uuid::new_v4()));
        let config = BotConfig {
            profile,
            database_url: format!("sqlite:{}?mode=rwc", path.display()),
            ..Default::default()
        };
        Bot::new(config, exchange).await.unwrap()
    }

    type Transition = (
        String,
        TradeSide,
        Decimal,
        Decimal,
        Option<ExitReason>,
        Option<DateTime<Utc>>,
        Vec<PartialExit>,
    );

    fn transition(p: &Position) -> Transition {
        (
            p.id.clone(),
            p.side,
            p.entry_price,
            p.initial_quantity,
            p.exit_reason,
            p.exit_time,
            p.partial_exits.clone(),
        )
    }

    #[tokio::test]
    async fn test_live_ticks_match_replay() {
        let mut profile = Profile::scalping();
        profile.symbols = vec!["BTCUSDT".to_string()];
        let closes: Vec<f64> = (0..600)
            .map(|i| {
                let x = i as f64;
                100.0 + 12.0 * (x / 37.0).sin() + 4.0 * (x / 11.0).cos() + x * 0.01
            })
            .collect();
        let entry = make_candles(&closes, profile.entry_timeframe);
        let primary = resample(&entry, profile.entry_timeframe, profile.primary_timeframe);

        let replay = Backtester::new(BacktestConfig {
            profile: profile.clone(),
            ..Default::default()
        })
        .unwrap()
        .run(&[SymbolSeries {
            symbol: "BTCUSDT".to_string(),
            primary: primary.clone(),
            entry: entry.clone(),
        }])
        .unwrap();

        let warmup = profile
            .warmup_candles
            .max(Engine::new(profile.clone()).unwrap().required_history());
        let count = entry.len();
        let script = Script {
            entry,
            primary,
            entry_tf: profile.entry_timeframe,
            cursor: AtomicUsize::new(warmup),
        };
        let mut bot = fresh_bot(MockExchange::scripted(script), profile).await;

        for i in warmup..count {
            let now = {
                let script = bot.gateway.script.as_ref().unwrap();
                script.cursor.store(i, Ordering::SeqCst);
                script.now()
            };
            assert_eq!(bot.tick(now).await.unwrap(), TickOutcome::Continue);
        }

        // Same closes, in the same order, with the same ledgers
        let mut live: Vec<Position> = bot
            .db
            .get_closed_positions(10_000)
            .await
            .unwrap()
            .iter()
            .map(|row| row.position().unwrap())
            .collect();
        live.sort_by_key(|p| (p.exit_time, p.id.clone()));
        let closed_in_run = replay.trades.len() - replay.closed_at_end;
        assert_eq!(
            live.iter().map(transition).collect::<Vec<_>>(),
            replay.trades[..closed_in_run].iter().map(transition).collect::<Vec<_>>()
        );

        // Whatever replay flattened at the end is still open live
        let open: Vec<String> = bot.engine().open_positions().map(|p| p.id.clone()).collect();
        let flattened: Vec<String> = replay.trades[closed_in_run..].iter().map(|p| p.id.clone()).collect();
        assert_eq!(open, flattened);

        let entries = replay
            .decisions
            .iter()
            .filter(|d| d.outcome.starts_with("entered"))
            .count();
        assert_eq!(entries, replay.trades.len());
    }

    #[tokio::test]
    async fn test_restore_loads_open_positions() {
        let bot = bot_with(MockExchange::new(dec!(10000), Some(vec![])), BreakerPolicy::HaltEntries, None).await;
        assert_eq!(bot.engine().open_count(), 1);
        assert_eq!(bot.engine().position("BTCUSDT").unwrap().entry_order_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_reconcile_closes_position_without_live_order() {
        let mut bot = bot_with(MockExchange::new(dec!(10000), Some(vec![])), BreakerPolicy::HaltEntries, None).await;
        bot.reconcile(now()).await;

        assert_eq!(bot.engine().open_count(), 0);
        assert!(bot.db.get_open_positions().await.unwrap().is_empty());
        let closed = bot.db.get_closed_positions(10).await.unwrap();
        assert_eq!(closed.len(), 1);
        let position = closed[0].position().unwrap();
        assert_eq!(position.exit_reason, Some(ExitReason::Reconciled));
        // Reconciliation never trades
        assert!(bot.gateway.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_position_on_failed_lookup() {
        let mut bot = bot_with(MockExchange::new(dec!(10000), None), BreakerPolicy::HaltEntries, None).await;
        bot.reconcile(now()).await;

        assert_eq!(bot.engine().open_count(), 1);
        assert_eq!(bot.db.get_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_matched_position() {
        let exchange = MockExchange::new(dec!(10000), Some(vec!["42".to_string()]));
        let mut bot = bot_with(exchange, BreakerPolicy::HaltEntries, None).await;
        bot.reconcile(now()).await;
        assert_eq!(bot.engine().open_count(), 1);
    }

    #[tokio::test]
    async fn test_breaker_halt_entries_leaves_positions() {
        let exchange = MockExchange::new(dec!(8000), Some(vec![]));
        let mut bot = bot_with(exchange, BreakerPolicy::HaltEntries, Some(dec!(10000))).await;

        let outcome = bot.tick(now()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Halt(ref r) if r.contains("Drawdown")));
        assert_eq!(bot.engine().open_count(), 1);
        assert!(bot.gateway.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_breaker_close_all_flattens_positions() {
        let exchange = MockExchange::new(dec!(8000), Some(vec![]));
        let mut bot = bot_with(exchange, BreakerPolicy::CloseAll, Some(dec!(10000))).await;

        let outcome = bot.tick(now()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Halt(_)));
        assert_eq!(bot.engine().open_count(), 0);
        assert_eq!(
            *bot.gateway.orders.lock().unwrap(),
            vec![("BTCUSDT".to_string(), TradeSide::Sell, dec!(10))]
        );

        let closed = bot.db.get_closed_positions(10).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].position().unwrap().exit_reason, Some(ExitReason::CircuitBreaker));
    }

    #[tokio::test]
    async fn test_tick_survives_data_errors_and_records_equity() {
        let mut bot = bot_with(MockExchange::new(dec!(10000), Some(vec![])), BreakerPolicy::HaltEntries, None).await;

        let outcome = bot.tick(now()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Continue);
        assert_eq!(bot.engine().open_count(), 1);

        let curve = bot.db.get_equity_curve(10).await.unwrap();
        assert_eq!(curve.len(), 1);
        let state = bot.db.get_bot_state().await.unwrap().risk_state().unwrap();
        assert_eq!(state.current_equity, dec!(10000));
    }
}
