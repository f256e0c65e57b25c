//! Database persistence for resuming after restart.
//!
//! Stores:
//! - Engine state snapshot (guard bookkeeping, equity, running flag)
//! - Positions, open and closed, as JSON state plus summary columns
//! - The partial-exit ledger
//! - Equity curve for P&L tracking

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{PartialExit, Position};
use crate::trading::PortfolioRiskState;

/// Database connection pool with full state management.
pub struct Database {
    pool: SqlitePool,
}

/// Engine state stored in database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotState {
    pub id: i64,
    pub profile: String,
    pub is_running: bool,
    pub equity: f64,
    pub risk_state: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotState {
    pub fn risk_state(&self) -> Result<PortfolioRiskState> {
        serde_json::from_str(&self.risk_state).context("Failed to parse stored risk state")
    }
}

/// Stored position record; `state` holds the full position as JSON.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub entry_price: f64,
    pub initial_quantity: f64,
    pub remaining_quantity: f64,
    pub realized_pnl: f64,
    pub exit_reason: Option<String>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub state: String,
}

impl StoredPosition {
    pub fn position(&self) -> Result<Position> {
        serde_json::from_str(&self.state)
            .with_context(|| format!("Failed to parse stored position {}", self.id))
    }
}

/// Equity curve point for tracking P&L over time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquityPoint {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub unrealized_pnl: f64,
    pub daily_pnl: f64,
    pub open_positions: i64,
}

/// Aggregate statistics over closed positions.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct ClosedStats {
    pub closed: i64,
    pub wins: i64,
    pub total_pnl: f64,
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Engine state
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                profile TEXT NOT NULL,
                is_running INTEGER NOT NULL DEFAULT 0,
                equity REAL NOT NULL DEFAULT 0,
                risk_state TEXT NOT NULL DEFAULT '{}',
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Positions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                entry_price REAL NOT NULL,
                initial_quantity REAL NOT NULL,
                remaining_quantity REAL NOT NULL,
                realized_pnl REAL NOT NULL DEFAULT 0,
                exit_reason TEXT,
                entry_time TEXT NOT NULL,
                exit_time TEXT,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Partial-exit ledger
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS partial_exits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                level INTEGER,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                pnl REAL NOT NULL,
                fee REAL NOT NULL,
                exit_time TEXT NOT NULL,
                FOREIGN KEY (position_id) REFERENCES positions(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Equity curve
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                equity REAL NOT NULL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                daily_pnl REAL NOT NULL DEFAULT 0,
                open_positions INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_partial_exits_position ON partial_exits(position_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_equity_curve_time ON equity_curve(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Bot State ====================

    /// Mark the engine running under `profile`, keeping any stored risk state.
    pub async fn init_bot_state(&self, profile: &str, now: DateTime<Utc>) -> Result<BotState> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (id, profile, is_running, started_at, updated_at)
            VALUES (1, ?, 1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                profile = excluded.profile,
                is_running = 1,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(profile)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to initialize bot state")?;

        self.get_bot_state().await
    }

    /// Get current bot state.
    pub async fn get_bot_state(&self) -> Result<BotState> {
        sqlx::query_as::<_, BotState>("SELECT * FROM bot_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("Bot state not initialized")
    }

    /// Bot state if one was ever stored.
    pub async fn find_bot_state(&self) -> Result<Option<BotState>> {
        sqlx::query_as::<_, BotState>("SELECT * FROM bot_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load bot state")
    }

    /// Persist a snapshot of the guard bookkeeping.
    pub async fn save_snapshot(
        &self,
        risk_state: &PortfolioRiskState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let json = serde_json::to_string(risk_state).context("Failed to serialize risk state")?;
        sqlx::query(
            r#"
            UPDATE bot_state SET
                equity = ?,
                risk_state = ?,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(to_f64(risk_state.current_equity))
        .bind(json)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to save snapshot")?;

        Ok(())
    }

    /// Mark bot as stopped.
    pub async fn mark_bot_stopped(&self, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE bot_state SET is_running = 0, updated_at = ? WHERE id = 1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Positions ====================

    /// Insert or update a position with its full state.
    pub async fn save_position(&self, position: &Position) -> Result<()> {
        let state = serde_json::to_string(position).context("Failed to serialize position")?;
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, side, status, entry_price, initial_quantity,
                remaining_quantity, realized_pnl, exit_reason, entry_time,
                exit_time, state, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                remaining_quantity = excluded.remaining_quantity,
                realized_pnl = excluded.realized_pnl,
                exit_reason = excluded.exit_reason,
                exit_time = excluded.exit_time,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&position.id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.status.as_str())
        .bind(to_f64(position.entry_price))
        .bind(to_f64(position.initial_quantity))
        .bind(to_f64(position.remaining_quantity))
        .bind(to_f64(position.realized_pnl))
        .bind(position.exit_reason.as_ref().map(|r| r.to_string()))
        .bind(position.entry_time)
        .bind(position.exit_time)
        .bind(state)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save position {}", position.id))?;

        Ok(())
    }

    /// Append one ledger entry for a position.
    pub async fn record_partial_exit(&self, position_id: &str, symbol: &str, exit: &PartialExit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO partial_exits (position_id, symbol, level, price, quantity, pnl, fee, exit_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position_id)
        .bind(symbol)
        .bind(exit.level.map(i64::from))
        .bind(to_f64(exit.price))
        .bind(to_f64(exit.quantity))
        .bind(to_f64(exit.pnl))
        .bind(to_f64(exit.fee))
        .bind(exit.time)
        .execute(&self.pool)
        .await
        .context("Failed to record partial exit")?;

        Ok(())
    }

    /// Positions still open, decoded from their stored state.
    pub async fn get_open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE status = 'OPEN' ORDER BY entry_time",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch open positions")?;

        rows.iter().map(StoredPosition::position).collect()
    }

    /// Most recent closed positions, newest first.
    pub async fn get_closed_positions(&self, limit: i64) -> Result<Vec<StoredPosition>> {
        sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE status = 'CLOSED' ORDER BY exit_time DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch closed positions")
    }

    pub async fn get_closed_stats(&self) -> Result<ClosedStats> {
        sqlx::query_as::<_, ClosedStats>(
            r#"
            SELECT
                COUNT(*) AS closed,
                COALESCE(SUM(CASE WHEN realized_pnl > 0 THEN 1 ELSE 0 END), 0) AS wins,
                COALESCE(SUM(realized_pnl), 0.0) AS total_pnl
            FROM positions WHERE status = 'CLOSED'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute closed-position stats")
    }

    pub async fn count_partial_exits(&self, position_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM partial_exits WHERE position_id = ?")
                .bind(position_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ==================== Equity Curve ====================

    /// Record an equity curve point.
    pub async fn record_equity_point(
        &self,
        timestamp: DateTime<Utc>,
        equity: Decimal,
        unrealized_pnl: Decimal,
        daily_pnl: Decimal,
        open_positions: usize,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_curve (timestamp, equity, unrealized_pnl, daily_pnl, open_positions)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(timestamp)
        .bind(to_f64(equity))
        .bind(to_f64(unrealized_pnl))
        .bind(to_f64(daily_pnl))
        .bind(open_positions as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get recent equity curve points, oldest first.
    pub async fn get_equity_curve(&self, limit: i64) -> Result<Vec<EquityPoint>> {
        let mut points = sqlx::query_as::<_, EquityPoint>(
            "SELECT * FROM equity_curve ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch equity curve")?;
        points.reverse();
        Ok(points)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, LadderStep, OpenRequest, TradeSide};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    async fn temp_db() -> (Database, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("ensemble-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite:{}?mode=rwc", path.display());
        (Database::new(&url).await.unwrap(), path)
    }

    fn position() -> Position {
        Position::open(OpenRequest {
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Buy,
            entry_price: dec!(100),
            quantity: dec!(10),
            stop_loss: dec!(95),
            take_profit: dec!(110),
            ladder: vec![
                LadderStep::new(dec!(0.5), dec!(0.5)),
                LadderStep::new(dec!(1.0), dec!(0.5)),
            ],
            trailing_enabled: false,
            signal_strength: 0.8,
            entry_time: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
            entry_order_id: Some("42".to_string()),
            quantity_step: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: Decimal::ZERO,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_bot_state_snapshot_round_trip() {
        let (db, path) = temp_db().await;
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        assert!(db.find_bot_state().await.unwrap().is_none());

        db.init_bot_state("swing", now).await.unwrap();
        let risk = PortfolioRiskState {
            peak_equity: dec!(10500),
            current_equity: dec!(10000),
            daily_pnl: dec!(-120.5),
            ..Default::default()
        };
        db.save_snapshot(&risk, now).await.unwrap();
        db.mark_bot_stopped(now).await.unwrap();

        let state = db.get_bot_state().await.unwrap();
        assert_eq!(state.profile, "swing");
        assert!(!state.is_running);
        assert_eq!(state.risk_state().unwrap(), risk);

        db.close().await;
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_open_then_closed_position() {
        let (db, path) = temp_db().await;
        let mut p = position();
        db.save_position(&p).await.unwrap();

        let open = db.get_open_positions().await.unwrap();
        assert_eq!(open, vec![p.clone()]);

        let t = p.entry_time + Duration::hours(2);
        let slice = p.take_partial(1, dec!(105), t, dec!(0.001)).unwrap().unwrap();
        db.record_partial_exit(&p.id, &p.symbol, &slice).await.unwrap();
        let last = p.close(dec!(104), t + Duration::hours(1), ExitReason::StopLoss, dec!(0.001)).unwrap();
        db.record_partial_exit(&p.id, &p.symbol, &last).await.unwrap();
        db.save_position(&p).await.unwrap();

        assert!(db.get_open_positions().await.unwrap().is_empty());
        let closed = db.get_closed_positions(10).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason.as_deref(), Some("stop-loss"));
        assert_eq!(closed[0].position().unwrap(), p);
        assert_eq!(db.count_partial_exits(&p.id).await.unwrap(), 2);

        let stats = db.get_closed_stats().await.unwrap();
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.wins, 1);

        db.close().await;
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_equity_curve_order() {
        let (db, path) = temp_db().await;
        let t0 = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        for (i, equity) in [dec!(10000), dec!(10100), dec!(9900)].into_iter().enumerate() {
            db.record_equity_point(t0 + Duration::hours(i as i64), equity, Decimal::ZERO, Decimal::ZERO, 0)
                .await
                .unwrap();
        }
        let curve = db.get_equity_curve(2).await.unwrap();
        assert_eq!(curve.len(), 2);
        assert_eq!(curve[0].equity, 10100.0);
        assert_eq!(curve[1].equity, 9900.0);

        db.close().await;
        let _ = std::fs::remove_file(path);
    }
}
