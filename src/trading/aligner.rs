//! Combine the slow "primary" trend reading with the fast "entry" reading.

use serde::{Deserialize, Serialize};

use crate::models::Direction;

/// How strictly the entry timeframe must agree with the primary trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    /// Trade only with a primary trend the entry reading agrees with
    Strict,
    /// Prefer the entry reading, penalizing conflicts instead of vetoing
    Permissive,
}

const PRIMARY_BLEND: f64 = 0.6;
const ENTRY_BLEND: f64 = 0.4;
const CONFLICT_FACTOR: f64 = 0.7;
const PRIMARY_ONLY_FACTOR: f64 = 0.8;

/// Aligned decision plus how it was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub direction: Direction,
    pub strength: f64,
    pub reason: &'static str,
    pub primary: (Direction, f64),
    pub entry: (Direction, f64),
}

pub fn align(primary: (Direction, f64), entry: (Direction, f64), mode: AlignmentMode) -> Alignment {
    let (p_dir, p_str) = primary;
    let (e_dir, e_str) = entry;
    let result = |direction: Direction, strength: f64, reason: &'static str| Alignment {
        direction,
        strength: if direction.is_hold() { 0.0 } else { strength.clamp(0.0, 1.0) },
        reason,
        primary,
        entry,
    };
    let blended = PRIMARY_BLEND * p_str + ENTRY_BLEND * e_str;

    match mode {
        AlignmentMode::Strict => {
            if p_dir.is_hold() {
                result(Direction::Hold, 0.0, "No primary trend")
            } else if e_dir == p_dir {
                result(p_dir, blended, "Aligned")
            } else {
                result(Direction::Hold, 0.0, "Signals not aligned")
            }
        }
        AlignmentMode::Permissive => {
            if !e_dir.is_hold() && e_dir == p_dir {
                result(e_dir, blended, "Aligned")
            } else if !e_dir.is_hold() {
                result(e_dir, e_str * CONFLICT_FACTOR, "Entry only, conflicts with primary")
            } else if !p_dir.is_hold() {
                result(p_dir, p_str * PRIMARY_ONLY_FACTOR, "Primary only")
            } else {
                result(Direction::Hold, 0.0, "No signal")
            }
        }
    }
}
