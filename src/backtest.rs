//! Historical replay through the same engine the live driver uses.
//!
//! Ticks are entry-timeframe candle closes, visited in (time, symbol) order.
//! Each tick is one `Engine::step`, the same call the live driver makes per
//! symbol. Primary candles are visible once they have closed by the tick
//! time.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::candles::clean_candles;
use crate::api::ExchangeGateway;
use crate::engine::{Engine, EntryDecision, SkipReason, StepInput};
use crate::metrics::PerformanceCalculator;
use crate::models::{
    Candle, Direction, ExitReason, OrderFill, PerformanceReport, Position, SymbolQuantization,
    Timeframe,
};
use crate::trading::{BreakerPolicy, PositionEvent, Profile};

/// Backtest configuration.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Starting capital in quote currency
    pub initial_capital: Decimal,

    /// Profile driving signals and risk
    pub profile: Profile,

    /// Exchange filters applied to every symbol
    pub quantization: SymbolQuantization,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(10000),
            profile: Profile::swing(),
            quantization: SymbolQuantization::default(),
        }
    }
}

/// Both timeframes of history for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolSeries {
    pub symbol: String,
    pub primary: Vec<Candle>,
    pub entry: Vec<Candle>,
}

/// What the engine concluded at one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub direction: Direction,
    pub strength: f64,
    pub outcome: String,
}

/// Results of a backtest run.
#[derive(Debug, Clone)]
pub struct BacktestResults {
    pub initial_capital: Decimal,

    /// Capital after every position is closed
    pub final_capital: Decimal,

    /// (final - initial) / initial
    pub total_return_pct: Decimal,

    pub report: PerformanceReport,

    /// Closed positions in close order
    pub trades: Vec<Position>,

    /// Equity after each tick timestamp
    pub equity_curve: Vec<(DateTime<Utc>, Decimal)>,

    pub decisions: Vec<DecisionRecord>,

    /// Directional signals that did not become trades
    pub skipped_entries: usize,

    /// Positions force-closed when the data ran out
    pub closed_at_end: usize,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl std::fmt::Display for BacktestResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = &self.report;
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Period: {} to {}",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"))?;
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:       ${:.2}", self.final_capital)?;
        writeln!(f, "Return:      {:.2}%", self.total_return_pct * dec!(100))?;
        writeln!(f, "Fees Paid:   ${:.2}", r.total_fees)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:       {} ({} skipped signals)", r.total_trades, self.skipped_entries)?;
        writeln!(f, "Winners:     {} ({:.1}%)", r.winning_trades, r.win_rate * 100.0)?;
        writeln!(f, "Losers:      {}", r.losing_trades)?;
        writeln!(f, "Avg Win:     ${:.2}", r.avg_win)?;
        writeln!(f, "Avg Loss:    ${:.2}", r.avg_loss)?;
        writeln!(f, "Largest Win: ${:.2}", r.largest_win)?;
        writeln!(f, "Largest Loss: ${:.2}", r.largest_loss)?;
        writeln!(f, "Profit Factor: {:.2}", r.profit_factor)?;
        writeln!(f, "Ladder Exits: {}", r.partial_exits)?;
        if self.closed_at_end > 0 {
            writeln!(f, "Closed at end of data: {}", self.closed_at_end)?;
        }
        writeln!(f)?;
        writeln!(f, "--- Exits ---")?;
        for (reason, count) in &r.exits_by_reason {
            writeln!(f, "{:<30} {}", reason, count)?;
        }
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown: {:.2}% (${:.2})", r.max_drawdown * 100.0, r.max_drawdown_usd)?;
        writeln!(f, "Sharpe Ratio: {:.2}", r.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", r.sortino_ratio)?;
        writeln!(f)?;
        writeln!(f, "--- Timing ---")?;
        writeln!(f, "Avg Hold:    {:.1} hours", r.avg_holding_hours)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// One replay step: the `index`-th entry candle of series `series`.
#[derive(Debug, Clone, Copy)]
struct Tick {
    time: DateTime<Utc>,
    series: usize,
    index: usize,
}

/// Backtesting engine.
pub struct Backtester {
    config: BacktestConfig,
}

impl Backtester {
    /// Create a new backtester.
    pub fn new(config: BacktestConfig) -> Result<Self> {
        config.profile.validate()?;
        if config.initial_capital <= Decimal::ZERO {
            bail!("Initial capital must be positive");
        }
        Ok(Self { config })
    }

    /// Fetch both timeframes for every profile symbol from a gateway.
    pub async fn fetch_series<G: ExchangeGateway>(
        gateway: &G,
        profile: &Profile,
        symbols: &[String],
        limit: usize,
    ) -> Result<Vec<SymbolSeries>> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let entry = gateway
                .get_candles(symbol, profile.entry_timeframe, limit)
                .await
                .with_context(|| format!("Failed to fetch {} entry candles", symbol))?;
            let primary = gateway
                .get_candles(symbol, profile.primary_timeframe, limit)
                .await
                .with_context(|| format!("Failed to fetch {} primary candles", symbol))?;
            info!(symbol = %symbol, entry = entry.len(), primary = primary.len(), "Fetched history");
            out.push(SymbolSeries {
                symbol: symbol.clone(),
                primary,
                entry,
            });
        }
        Ok(out)
    }

    /// Replay every series to the end of data.
    pub fn run(&self, data: &[SymbolSeries]) -> Result<BacktestResults> {
        let profile = &self.config.profile;
        let quant = &self.config.quantization;
        let entry_tf = profile.entry_timeframe;
        let primary_tf = profile.primary_timeframe;
        let mut engine = Engine::new(profile.clone())?;

        let warmup = profile.warmup_candles.max(engine.required_history());
        let window = profile.candle_limit.max(engine.required_history());

        let mut ticks: Vec<Tick> = data
            .iter()
            .enumerate()
            .flat_map(|(series, s)| {
                s.entry
                    .iter()
                    .enumerate()
                    .skip(warmup)
                    .map(move |(index, c)| Tick {
                        time: c.close_time(entry_tf),
                        series,
                        index,
                    })
            })
            .collect();
        ticks.sort_by(|a, b| {
            a.time
                .cmp(&b.time)
                .then_with(|| data[a.series].symbol.cmp(&data[b.series].symbol))
                .then(a.index.cmp(&b.index))
        });

        let (Some(first), Some(last)) = (ticks.first().copied(), ticks.last().copied()) else {
            bail!(
                "Not enough history: need more than {} entry candles per symbol",
                warmup
            );
        };
        info!(
            symbols = data.len(),
            ticks = ticks.len(),
            start = %first.time,
            end = %last.time,
            "Starting backtest"
        );

        let mut capital = self.config.initial_capital;
        let mut marks: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut trades: Vec<Position> = Vec::new();
        let mut decisions: Vec<DecisionRecord> = Vec::new();
        let mut equity_curve: Vec<(DateTime<Utc>, Decimal)> = Vec::new();
        let mut skipped = 0usize;
        let mut order_seq = 0u64;
        let mut breaker_logged = false;

        for tick in &ticks {
            let series = &data[tick.series];
            let symbol = series.symbol.as_str();
            let entry_window = &series.entry[(tick.index + 1).saturating_sub(window)..=tick.index];
            let primary_visible = visible_primary(&series.primary, primary_tf, tick.time);
            let primary_window = &primary_visible[primary_visible.len().saturating_sub(window)..];

            // Manage, mark, breaker, then entry at the candle close
            let input = StepInput {
                symbol,
                now: tick.time,
                primary: primary_window,
                entry: entry_window,
                quantization: quant,
            };
            let Some(step) = engine.step(&input, |engine, obs, managed| {
                marks.insert(symbol.to_string(), obs.close);
                capital + managed.realized() + engine.unrealized_pnl(&marks)
            })?
            else {
                warn!(symbol, time = %tick.time, "Skipping non-finite candle");
                continue;
            };

            capital += step.managed.realized();
            for event in &step.managed.events {
                if let PositionEvent::Closed { reason, realized_pnl, .. } = event {
                    debug!(symbol, reason = %reason, pnl = %realized_pnl, "Backtest position closed");
                }
            }
            trades.extend(step.managed.closed);

            if let Some(reason) = step.breaker {
                if !breaker_logged {
                    warn!(reason = %reason, time = %tick.time, "Circuit breaker tripped");
                    breaker_logged = true;
                }
                if profile.risk.breaker_policy == BreakerPolicy::CloseAll {
                    let open: Vec<String> = engine.open_positions().map(|p| p.symbol.clone()).collect();
                    for open_symbol in open {
                        let price = marks.get(&open_symbol).copied().unwrap_or(step.observation.close);
                        if let Some((event, closed)) = engine.close_position(
                            &open_symbol,
                            price,
                            tick.time,
                            ExitReason::CircuitBreaker,
                        )? {
                            capital += event.realized();
                            trades.push(closed);
                        }
                    }
                }
                push_equity(&mut equity_curve, tick.time, capital + engine.unrealized_pnl(&marks));
                continue;
            }
            breaker_logged = false;

            if let Some(EntryDecision { signal, plan }) = step.entry {
                let outcome = match &plan {
                    Ok(plan) => format!("entered {:?} {} {}", plan.tier, plan.side, plan.quantity),
                    Err(reason) => reason.to_string(),
                };
                if signal.alignment.direction != Direction::Hold
                    && !matches!(plan, Ok(_) | Err(SkipReason::NoSignal(_)))
                {
                    skipped += 1;
                }
                decisions.push(DecisionRecord {
                    time: tick.time,
                    symbol: symbol.to_string(),
                    direction: signal.alignment.direction,
                    strength: signal.alignment.strength,
                    outcome,
                });

                if let Ok(plan) = plan {
                    order_seq += 1;
                    let fill = OrderFill {
                        order_id: format!("bt-{}", order_seq),
                        client_order_id: format!("bt-{}", order_seq),
                        filled_quantity: plan.quantity,
                        avg_price: plan.price,
                        commission: Decimal::ZERO,
                    };
                    engine.open_position(&plan, &fill, tick.time, quant)?;
                }
            }

            push_equity(&mut equity_curve, tick.time, capital + engine.unrealized_pnl(&marks));
        }

        // Flatten whatever is still open at the last mark
        let open: Vec<String> = engine.open_positions().map(|p| p.symbol.clone()).collect();
        let closed_at_end = open.len();
        for symbol in open {
            let price = marks.get(&symbol).copied().unwrap_or_default();
            if let Some((event, closed)) =
                engine.close_position(&symbol, price, last.time, ExitReason::Manual)?
            {
                capital += event.realized();
                trades.push(closed);
            }
        }
        push_equity(&mut equity_curve, last.time, capital);

        let curve: Vec<Decimal> = equity_curve.iter().map(|(_, e)| *e).collect();
        let report = PerformanceCalculator::calculate(&trades, &curve);
        let initial = self.config.initial_capital;
        let results = BacktestResults {
            initial_capital: initial,
            final_capital: capital,
            total_return_pct: (capital - initial) / initial,
            report,
            trades,
            equity_curve,
            decisions,
            skipped_entries: skipped,
            closed_at_end,
            start_time: first.time,
            end_time: last.time,
        };
        info!(
            trades = results.trades.len(),
            final_capital = %results.final_capital.round_dp(2),
            "Backtest complete"
        );
        Ok(results)
    }
}

/// Primary candles that have closed by `time`.
fn visible_primary(primary: &[Candle], timeframe: Timeframe, time: DateTime<Utc>) -> &[Candle] {
    let end = primary.partition_point(|c| c.close_time(timeframe) <= time);
    &primary[..end]
}

/// One point per timestamp; later ticks at the same time overwrite.
fn push_equity(curve: &mut Vec<(DateTime<Utc>, Decimal)>, time: DateTime<Utc>, equity: Decimal) {
    match curve.last_mut() {
        Some((last, value)) if *last == time => *value = equity,
        _ => curve.push((time, equity)),
    }
}

// ==================== CSV ====================

#[derive(Debug, Deserialize)]
struct CsvCandle {
    #[serde(alias = "open_time", alias = "time", alias = "date")]
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        // Epoch milliseconds or seconds
        let parsed = if n.abs() >= 100_000_000_000 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        };
        return parsed.with_context(|| format!("Timestamp out of range: {}", raw));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .with_context(|| format!("Unrecognized timestamp: {}", raw))
}

/// Load OHLCV candles from a CSV with a header row
/// (`timestamp,open,high,low,close,volume`).
pub fn load_csv(path: &Path, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut candles = Vec::new();
    for (line, row) in reader.deserialize::<CsvCandle>().enumerate() {
        let row = row.with_context(|| format!("Bad CSV row {} in {}", line + 2, path.display()))?;
        candles.push(Candle {
            open_time: parse_timestamp(&row.timestamp)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }
    // Historical data: nothing is still forming
    let horizon = candles
        .iter()
        .map(|c| c.close_time(timeframe))
        .max()
        .unwrap_or_else(Utc::now);
    clean_candles(symbol, candles, timeframe, horizon)
        .with_context(|| format!("Unusable candle data in {}", path.display()))
}

/// Aggregate entry candles into complete primary buckets.
pub fn resample(candles: &[Candle], from: Timeframe, to: Timeframe) -> Vec<Candle> {
    let per_bucket = (to.seconds() / from.seconds().max(1)).max(1) as usize;
    let mut out: Vec<Candle> = Vec::new();
    let mut count = 0usize;
    for c in candles {
        let bucket = to.floor(c.open_time);
        match out.last_mut() {
            Some(cur) if cur.open_time == bucket => {
                cur.high = cur.high.max(c.high);
                cur.low = cur.low.min(c.low);
                cur.close = c.close;
                cur.volume += c.volume;
                count += 1;
            }
            _ => {
                if count > 0 && count < per_bucket {
                    out.pop();
                }
                out.push(Candle {
                    open_time: bucket,
                    ..*c
                });
                count = 1;
            }
        }
    }
    if count > 0 && count < per_bucket {
        out.pop();
    }
    out
}

const TRADE_CSV_HEADER: [&str; 14] = [
    "id",
    "symbol",
    "side",
    "entry_time",
    "exit_time",
    "entry_price",
    "exit_price",
    "quantity",
    "realized_pnl",
    "pnl_pct",
    "fees",
    "exit_reason",
    "ladder_exits",
    "signal_strength",
];

#[derive(Debug, Serialize)]
struct TradeRow<'a> {
    id: &'a str,
    symbol: &'a str,
    side: &'a str,
    entry_time: DateTime<Utc>,
    exit_time: Option<DateTime<Utc>>,
    entry_price: Decimal,
    exit_price: Option<Decimal>,
    quantity: Decimal,
    realized_pnl: Decimal,
    pnl_pct: Decimal,
    fees: Decimal,
    exit_reason: String,
    ladder_exits: usize,
    signal_strength: f64,
}

/// Write closed trades to CSV.
pub fn export_trades_csv(path: &Path, trades: &[Position]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    // Explicit header so an empty run still yields a readable file
    writer.write_record(TRADE_CSV_HEADER)?;
    for p in trades {
        writer.serialize(TradeRow {
            id: &p.id,
            symbol: &p.symbol,
            side: p.side.as_str(),
            entry_time: p.entry_time,
            exit_time: p.exit_time,
            entry_price: p.entry_price,
            exit_price: p.exit_price,
            quantity: p.initial_quantity,
            realized_pnl: p.realized_pnl.round_dp(8),
            pnl_pct: p.pnl_pct.round_dp(4),
            fees: p.fees.round_dp(8),
            exit_reason: p.exit_reason.map(|r| r.to_string()).unwrap_or_default(),
            ladder_exits: p.partial_exits.iter().filter(|e| e.level.is_some()).count(),
            signal_strength: p.signal_strength,
        })?;
    }
    writer.flush().context("Failed to flush trade CSV")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::candle::make_candles;
    use crate::models::PositionStatus;

    fn wave(n: usize, phase: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let x = i as f64;
                100.0 + 12.0 * (x / 37.0 + phase).sin() + 4.0 * (x / 11.0).cos() + x * 0.01
            })
            .collect()
    }

    fn series(symbol: &str, phase: f64) -> SymbolSeries {
        let profile = Profile::scalping();
        let entry = make_candles(&wave(900, phase), profile.entry_timeframe);
        let primary = resample(&entry, profile.entry_timeframe, profile.primary_timeframe);
        SymbolSeries {
            symbol: symbol.to_string(),
            primary,
            entry,
        }
    }

    fn backtester() -> Backtester {
        Backtester::new(BacktestConfig {
            profile: Profile::scalping(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_replay_is_deterministic() {
        let data = vec![series("BTCUSDT", 0.0), series("ETHUSDT", 1.3)];
        let a = backtester().run(&data).unwrap();
        let b = backtester().run(&data).unwrap();

        assert_eq!(a.trades, b.trades);
        assert_eq!(a.equity_curve, b.equity_curve);
        assert_eq!(a.decisions, b.decisions);
        assert_eq!(a.final_capital, b.final_capital);
    }

    #[test]
    fn test_capital_reconciles_with_trades() {
        let data = vec![series("BTCUSDT", 0.4)];
        let results = backtester().run(&data).unwrap();

        let realized: Decimal = results.trades.iter().map(|p| p.realized_pnl).sum();
        assert_eq!(results.final_capital, results.initial_capital + realized);
        for trade in &results.trades {
            assert_eq!(trade.status, PositionStatus::Closed);
            let exited: Decimal = trade.partial_exits.iter().map(|e| e.quantity).sum();
            assert_eq!(exited, trade.initial_quantity);
        }
        assert_eq!(
            results.equity_curve.last().map(|(_, e)| *e),
            Some(results.final_capital)
        );
    }

    #[test]
    fn test_decisions_start_after_warmup() {
        let data = vec![series("BTCUSDT", 0.0)];
        let results = backtester().run(&data).unwrap();
        let profile = Profile::scalping();
        let warmup = profile
            .warmup_candles
            .max(Engine::new(profile).unwrap().required_history());
        let warmup_close = data[0].entry[warmup].close_time(Timeframe::M5);
        assert_eq!(results.start_time, warmup_close);
        assert!(results.decisions.iter().all(|d| d.time >= warmup_close));
    }

    #[test]
    fn test_too_little_history() {
        let profile = Profile::scalping();
        let entry = make_candles(&wave(150, 0.0), profile.entry_timeframe);
        let data = vec![SymbolSeries {
            symbol: "BTCUSDT".into(),
            primary: resample(&entry, profile.entry_timeframe, profile.primary_timeframe),
            entry,
        }];
        assert!(backtester().run(&data).is_err());
    }

    #[test]
    fn test_primary_visibility_has_no_lookahead() {
        let entry = make_candles(&wave(12, 0.0), Timeframe::M5);
        let primary = resample(&entry, Timeframe::M5, Timeframe::M15);
        assert_eq!(primary.len(), 4);

        // Close of the 5th entry candle: only the first 15m bucket has closed
        let t = entry[4].close_time(Timeframe::M5);
        assert_eq!(visible_primary(&primary, Timeframe::M15, t).len(), 1);
        let t = entry[5].close_time(Timeframe::M5);
        assert_eq!(visible_primary(&primary, Timeframe::M15, t).len(), 2);
    }

    #[test]
    fn test_resample_aggregates_ohlcv() {
        let entry = make_candles(&[10.0, 12.0, 11.0, 13.0], Timeframe::M5);
        let primary = resample(&entry, Timeframe::M5, Timeframe::M15);
        // Trailing incomplete bucket dropped
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].open, entry[0].open);
        assert_eq!(primary[0].close, 11.0);
        assert_eq!(primary[0].high, entry[1].high);
        assert_eq!(primary[0].volume, 3000.0);
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
        assert_eq!(parse_timestamp("1704067200000").unwrap(), expected);
        assert_eq!(parse_timestamp("1704067200").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-01T00:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-01 00:00:00").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_csv_load_and_export() {
        let dir = std::env::temp_dir();
        let input = dir.join(format!("candles-{}.csv", uuid::Uuid::new_v4()));
        let mut body = String::from("timestamp,open,high,low,close,volume\n");
        for (i, c) in make_candles(&wave(30, 0.0), Timeframe::H1).iter().enumerate().rev() {
            body.push_str(&format!(
                "{},{},{},{},{},{}\n",
                c.open_time.timestamp_millis(),
                c.open,
                c.high,
                c.low,
                c.close,
                if i == 3 { f64::NAN } else { c.volume }
            ));
        }
        std::fs::write(&input, body).unwrap();

        let candles = load_csv(&input, "BTCUSDT", Timeframe::H1).unwrap();
        assert_eq!(candles.len(), 29);
        assert!(candles.windows(2).all(|w| w[0].open_time < w[1].open_time));

        let results = backtester().run(&[series("BTCUSDT", 0.9)]).unwrap();
        let output = dir.join(format!("trades-{}.csv", uuid::Uuid::new_v4()));
        export_trades_csv(&output, &results.trades).unwrap();
        let written = std::fs::read_to_string(&output).unwrap();
        assert!(written.starts_with("id,symbol,side,entry_time"));
        assert_eq!(written.lines().count(), results.trades.len() + 1);

        let _ = std::fs::remove_file(input);
        let _ = std::fs::remove_file(output);
    }
}
