//! Signal Ensemble Trader
//!
//! Combines several technical strategies into one weighted signal, confirms it
//! across two timeframes, and manages risk-sized positions with laddered
//! take-profits and trailing stops. Runs live, paper, or as a candle replay.

mod api;
mod backtest;
mod bot;
mod db;
mod engine;
mod indicators;
mod metrics;
mod models;
mod notify;
mod strategies;
mod trading;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{BinanceClient, ExchangeGateway, PaperGateway, BINANCE_BASE_URL, BINANCE_TESTNET_URL};
use crate::backtest::{export_trades_csv, load_csv, resample, BacktestConfig, Backtester, SymbolSeries};
use crate::bot::{Bot, BotConfig};
use crate::db::Database;
use crate::metrics::PerformanceCalculator;
use crate::notify::NotifierConfig;
use crate::trading::{EnsemblePreset, Profile, ProfileKind};

/// Signal ensemble trading engine CLI.
#[derive(Parser)]
#[command(name = "ensembletrader")]
#[command(about = "Multi-strategy signal ensemble with risk-sized position management", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./ensemble.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Trading profile (swing, scalping)
    #[arg(short, long, env = "TRADING_PROFILE", default_value = "swing")]
    profile: String,

    /// Ensemble preset (conservative, aggressive)
    #[arg(long, default_value = "conservative")]
    preset: String,

    /// Full profile as JSON; overrides --profile and --preset
    #[arg(long)]
    profile_file: Option<PathBuf>,

    /// Comma-separated symbols overriding the profile's list
    #[arg(short, long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,

    /// Use the exchange testnet
    #[arg(long, env = "BINANCE_TESTNET")]
    testnet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay the engine over historical candles
    Backtest {
        /// Entry-timeframe CSV per symbol as SYMBOL=PATH (repeatable);
        /// fetches from the exchange when omitted
        #[arg(long = "csv")]
        csv: Vec<String>,

        /// Candles to fetch per timeframe
        #[arg(long, default_value = "1000")]
        limit: usize,

        /// Initial capital in quote currency
        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Write closed trades to this CSV file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Start the live trading loop
    Run {
        /// Paper fills against live market data
        #[arg(long)]
        dry_run: bool,

        /// Starting cash for --dry-run
        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Quote asset counted as account equity
        #[arg(long, default_value = "USDT")]
        quote_asset: String,

        /// Seconds to wait for a market order before giving up
        #[arg(long, default_value = "30")]
        order_timeout_secs: u64,

        #[arg(long, env = "BINANCE_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        #[arg(long, env = "BINANCE_API_SECRET", hide_env_values = true)]
        api_secret: Option<String>,

        /// Slack-style incoming webhook for notifications
        #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
        webhook_url: Option<String>,

        #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
        telegram_token: Option<String>,

        #[arg(long, env = "TELEGRAM_CHAT_ID")]
        telegram_chat_id: Option<String>,
    },

    /// Print the effective profile as JSON after validating it
    Config,

    /// Show stored state and closed-trade statistics
    Status {
        /// Recent closed trades to list
        #[arg(short, long, default_value = "10")]
        trades: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let profile = load_profile(&cli)?;
    let base_url = if cli.testnet {
        BINANCE_TESTNET_URL
    } else {
        BINANCE_BASE_URL
    };

    match cli.command {
        Commands::Backtest {
            csv,
            limit,
            capital,
            export,
        } => {
            info!(
                profile = %profile.kind,
                capital = capital,
                sources = if csv.is_empty() { "exchange" } else { "csv" },
                "Starting backtest"
            );

            let data = if csv.is_empty() {
                let client = BinanceClient::with_base_url(base_url.to_string())?;
                Backtester::fetch_series(&client, &profile, &profile.symbols, limit).await?
            } else {
                load_csv_series(&profile, &csv)?
            };

            let backtester = Backtester::new(BacktestConfig {
                initial_capital: to_decimal(capital)?,
                profile,
                ..Default::default()
            })?;
            let results = backtester.run(&data)?;
            println!("{}", results);

            if let Some(path) = export {
                export_trades_csv(&path, &results.trades)?;
                println!("Trades written to {}", path.display());
            }
        }

        Commands::Run {
            dry_run,
            capital,
            quote_asset,
            order_timeout_secs,
            api_key,
            api_secret,
            webhook_url,
            telegram_token,
            telegram_chat_id,
        } => {
            let config = BotConfig {
                profile,
                dry_run,
                paper_capital: to_decimal(capital)?,
                database_url: cli.database.clone(),
                notifier: NotifierConfig {
                    webhook_url,
                    telegram_token,
                    telegram_chat_id,
                },
            };

            println!("\n=== Signal Ensemble Trader ===");
            println!("Profile:  {}", config.profile.kind);
            println!("Symbols:  {}", config.profile.symbols.join(", "));
            println!(
                "Candles:  {} entries, {} trend",
                config.profile.entry_timeframe, config.profile.primary_timeframe
            );
            println!(
                "Mode:     {}",
                if dry_run { "DRY RUN (paper fills)" } else { "LIVE TRADING" }
            );
            println!("\nPress Ctrl+C to stop.\n");

            let market = BinanceClient::with_base_url(base_url.to_string())?
                .with_quote_asset(quote_asset)
                .with_order_timeout(Duration::from_secs(order_timeout_secs));
            if dry_run {
                let paper = PaperGateway::new(
                    market,
                    config.paper_capital,
                    config.profile.risk.slippage,
                    config.profile.risk.taker_fee,
                );
                run_bot(config, paper).await?;
            } else {
                let (Some(key), Some(secret)) = (api_key, api_secret) else {
                    bail!("Live trading needs BINANCE_API_KEY and BINANCE_API_SECRET (or use --dry-run)");
                };
                run_bot(config, market.with_credentials(key, secret)).await?;
            }
        }

        Commands::Config => {
            let json = serde_json::to_string_pretty(&profile).context("Failed to serialize profile")?;
            println!("{}", json);
            eprintln!("Profile '{}' is valid", profile.kind);
        }

        Commands::Status { trades } => {
            let db = Database::new(&cli.database).await?;
            let Some(bot_state) = db.find_bot_state().await? else {
                println!("No bot session found. Run 'ensembletrader run' to start the bot.");
                return Ok(());
            };
            let risk = bot_state.risk_state()?;
            let stats = db.get_closed_stats().await?;
            let open = db.get_open_positions().await?;
            let recent = db.get_closed_positions(trades).await?;

            println!("\n=== Bot Status ===");
            println!("Profile:          {}", bot_state.profile);
            println!("Running:          {}", if bot_state.is_running { "Yes" } else { "No" });
            println!("Started:          {}", bot_state.started_at);
            println!("Last Update:      {}", bot_state.updated_at);

            println!("\n=== Portfolio ===");
            println!("Equity:           ${:.2}", risk.current_equity);
            println!("Peak Equity:      ${:.2}", risk.peak_equity);
            println!("Drawdown:         {:.2}%", risk.current_drawdown * Decimal::from(100));
            println!("Daily P&L:        ${:.2}", risk.daily_pnl);

            println!("\n=== Trading ===");
            println!("Open Positions:   {}", open.len());
            println!("Closed Trades:    {}", stats.closed);
            if stats.closed > 0 {
                println!(
                    "Win Rate:         {:.1}%",
                    stats.wins as f64 / stats.closed as f64 * 100.0
                );
            }
            println!("Realized P&L:     ${:.2}", stats.total_pnl);

            if !open.is_empty() {
                println!("\n=== Open Positions ===");
                for pos in &open {
                    println!(
                        "  {:<10} {:<4} {} @ {} (SL {}, TP {})",
                        pos.symbol, pos.side, pos.remaining_quantity, pos.entry_price, pos.stop_loss, pos.take_profit
                    );
                }
            }

            if !recent.is_empty() {
                println!("\n=== Recent Trades ===");
                for stored in &recent {
                    let fills = db.count_partial_exits(&stored.id).await?;
                    let pnl_sign = if stored.realized_pnl >= 0.0 { "+" } else { "" };
                    println!(
                        "  {:<10} {:<4} {:<14} {:>2} fills  {}${:.2}",
                        stored.symbol,
                        stored.side,
                        stored.exit_reason.as_deref().unwrap_or("-"),
                        fills,
                        pnl_sign,
                        stored.realized_pnl
                    );
                }

                let positions = recent
                    .iter()
                    .map(|s| s.position())
                    .collect::<Result<Vec<_>>>()?;
                let curve: Vec<Decimal> = db
                    .get_equity_curve(10_000)
                    .await?
                    .iter()
                    .filter_map(|p| Decimal::from_f64(p.equity))
                    .collect();
                let report = PerformanceCalculator::calculate(&positions, &curve);
                println!("\n=== Performance (recent) ===");
                println!("Profit Factor:    {:.2}", report.profit_factor);
                println!("Expectancy:       ${:.2}", report.expectancy);
                println!("Max Drawdown:     {:.2}%", report.max_drawdown * 100.0);
                println!("Sharpe Ratio:     {:.2}", report.sharpe_ratio);
                println!("Sortino Ratio:    {:.2}", report.sortino_ratio);
            }
            db.close().await;
        }
    }

    Ok(())
}

/// Resolve the profile from a JSON file or a named preset, then apply overrides.
fn load_profile(cli: &Cli) -> Result<Profile> {
    let mut profile = match &cli.profile_file {
        Some(path) => Profile::from_json_file(path)?,
        None => {
            let kind: ProfileKind = cli.profile.parse()?;
            let preset: EnsemblePreset = cli.preset.parse()?;
            Profile::with_preset(kind, preset)
        }
    };
    if let Some(symbols) = &cli.symbols {
        profile.symbols = symbols.iter().map(|s| s.trim().to_uppercase()).collect();
    }
    profile.validate()?;
    Ok(profile)
}

/// Load `SYMBOL=PATH` entry-timeframe CSVs and derive the primary timeframe.
fn load_csv_series(profile: &Profile, sources: &[String]) -> Result<Vec<SymbolSeries>> {
    sources
        .iter()
        .map(|arg| {
            let (symbol, path) = arg
                .split_once('=')
                .with_context(|| format!("Expected SYMBOL=PATH, got '{}'", arg))?;
            let symbol = symbol.trim().to_uppercase();
            let entry = load_csv(&PathBuf::from(path), &symbol, profile.entry_timeframe)?;
            let primary = resample(&entry, profile.entry_timeframe, profile.primary_timeframe);
            info!(symbol = %symbol, entry = entry.len(), primary = primary.len(), "Loaded CSV history");
            Ok(SymbolSeries {
                symbol,
                primary,
                entry,
            })
        })
        .collect()
}

async fn run_bot<G: ExchangeGateway>(config: BotConfig, gateway: G) -> Result<()> {
    let mut bot = Bot::new(config, gateway).await?;
    bot.run().await
}

fn to_decimal(value: f64) -> Result<Decimal> {
    Decimal::try_from(value).with_context(|| format!("Invalid amount: {}", value))
}
