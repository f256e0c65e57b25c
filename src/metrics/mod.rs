//! Performance metrics over closed positions and equity curves.

mod calculator;

pub use calculator::PerformanceCalculator;
