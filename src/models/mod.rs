//! Data models for candles, signals, fills, quantization rules, positions,
//! and performance reports.

pub mod candle;
mod market;
mod metrics;
mod position;
mod signal;
mod trade;

pub use candle::{Candle, Timeframe};
pub use market::{round_down_to, SymbolQuantization};
pub use metrics::PerformanceReport;
pub use position::{
    ExitReason, LadderStep, OpenRequest, PartialExit, Position, PositionError, PositionStatus,
    TakeProfitLevel, DUST_QUANTITY,
};
pub use signal::{Direction, SignalReading, StrategyKind};
pub use trade::{OrderFill, TradeSide};
