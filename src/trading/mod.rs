//! Decision engine pieces: ensemble, timeframe alignment, sizing, stops,
//! position lifecycle, and the portfolio guard.

pub mod aligner;
mod config;
pub mod ensemble;
mod guard;
pub mod lifecycle;
mod position_sizer;
pub mod stops;

pub use aligner::{align, Alignment, AlignmentMode};
pub use config::{
    validate_ladder, BreakerPolicy, EnsemblePreset, EntryGate, Profile, ProfileKind,
    RiskParameters, SizingTiers, StopLossPolicy, TakeProfitPolicy, TrailingStopConfig,
};
pub use ensemble::{Ensemble, EnsembleDecision};
pub use guard::{PortfolioGuard, PortfolioRiskState};
pub use lifecycle::PositionEvent;
pub use position_sizer::{PositionSizer, SizingRejection};
