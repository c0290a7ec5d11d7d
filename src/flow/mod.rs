//! Phase-gate engine: the ordered construction sequence, the gate
//! checkpoints between phase groups, and the rules deciding whether a lot
//! may move forward.

pub mod engine;

pub use engine::FlowEngine;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::models::GateStatus;

/// One ordered stage of the construction sequence. Reference data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseDef {
    pub ordinal: u32,
    pub id: &'static str,
    pub name: &'static str,
}

/// The fixed construction sequence. Ordinals are 1-based.
pub const PHASES: [PhaseDef; 6] = [
    PhaseDef { ordinal: 1, id: "framing", name: "Framing" },
    PhaseDef { ordinal: 2, id: "walls", name: "Walls" },
    PhaseDef { ordinal: 3, id: "roof", name: "Roof" },
    PhaseDef { ordinal: 4, id: "trades", name: "Trades" },
    PhaseDef { ordinal: 5, id: "backframe", name: "Backframe" },
    PhaseDef { ordinal: 6, id: "final", name: "Final" },
];

pub fn phase_count() -> u32 {
    PHASES.len() as u32
}

pub fn phase_by_ordinal(ordinal: u32) -> Option<&'static PhaseDef> {
    PHASES.iter().find(|p| p.ordinal == ordinal)
}

/// A checkpoint between two phase groups. A lot is not past the gate until
/// its recorded status is `passed`; unseen gates count as `not_started`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateTransition {
    pub id: &'static str,
    pub name: &'static str,
    /// The phase ordinal this transition guards entry into.
    pub enters_ordinal: u32,
}

pub const TRANSITIONS: [GateTransition; 3] = [
    GateTransition { id: "framing_to_roofing", name: "Framing to Roofing", enters_ordinal: 3 },
    GateTransition { id: "roofing_to_trades", name: "Roofing to Trades", enters_ordinal: 4 },
    GateTransition { id: "trades_to_final", name: "Trades to Final", enters_ordinal: 6 },
];

pub fn transition_by_id(id: &str) -> Option<&'static GateTransition> {
    TRANSITIONS.iter().find(|t| t.id == id)
}

/// Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseDisplayStatus {
    Done,
    Blocked,
    Active,
    Pending,
}

/// Display status of one phase for a lot at `current_phase`.
pub fn display_status(ordinal: u32, current_phase: u32, open_items: u32) -> PhaseDisplayStatus {
    use std::cmp::Ordering;
    match ordinal.cmp(&current_phase) {
        Ordering::Less => {
            if open_items > 0 {
                PhaseDisplayStatus::Blocked
            } else {
                PhaseDisplayStatus::Done
            }
        }
        Ordering::Equal => {
            if open_items > 0 {
                PhaseDisplayStatus::Blocked
            } else {
                PhaseDisplayStatus::Active
            }
        }
        Ordering::Greater => PhaseDisplayStatus::Pending,
    }
}

/// Derived share of the sequence completed once a lot sits at `ordinal`.
pub fn progress_for_phase(ordinal: u32) -> u8 {
    let done = ordinal.saturating_sub(1).min(phase_count());
    ((done * 100) / phase_count()) as u8
}

/// One phase of the sequence as seen from a specific lot.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseView {
    pub ordinal: u32,
    pub id: &'static str,
    pub name: &'static str,
    pub status: PhaseDisplayStatus,
    pub open_items: u32,
}

/// Everything a caller needs to render a lot's gating state.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStatus {
    pub lot_id: i64,
    pub current_phase: u32,
    pub blocking_by_phase: HashMap<u32, u32>,
    pub gate_status: HashMap<String, GateStatus>,
    pub phases: Vec<PhaseView>,
}

/// Why an advance was rejected. Carried back to the caller as data, not an
/// error; the caller decides what to resolve.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    OpenItems { phase_id: String, count: u32 },
    GateNotPassed { transition_id: String, status: GateStatus },
    SequenceComplete,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenItems { phase_id, count } => {
                write!(
                    f,
                    "{} open item{} at {}",
                    count,
                    if *count == 1 { "" } else { "s" },
                    phase_id
                )
            }
            Self::GateNotPassed {
                transition_id,
                status,
            } => write!(f, "gate {} is {}", transition_id, status),
            Self::SequenceComplete => write!(f, "lot is already at the final phase"),
        }
    }
}

/// Result of an advance attempt. Conflicts surface separately as
/// `FlowError::Conflict` since they are retryable rather than actionable.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    Advanced { new_phase: u32 },
    Blocked(BlockReason),
}
