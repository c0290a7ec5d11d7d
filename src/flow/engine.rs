//! Read-mostly flow computation and the guarded phase advance.

use std::collections::HashMap;

use tracing::{debug, info};

use super::{
    display_status, phase_by_ordinal, phase_count, progress_for_phase, AdvanceOutcome, BlockReason,
    FlowStatus, PhaseView, PHASES, TRANSITIONS,
};
use crate::errors::FlowError;
use crate::store::models::GateStatus;
use crate::store::DbHandle;

/// Computes gating state for lots and performs guarded advances. Stateless
/// per request; safe to run concurrently across different lots.
#[derive(Clone)]
pub struct FlowEngine {
    db: DbHandle,
}

impl FlowEngine {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Blocking counts per phase, gate status per transition (unseen gates
    /// default to `not_started`), and the derived per-phase display status.
    pub async fn flow_status(&self, lot_id: i64) -> Result<FlowStatus, FlowError> {
        let (lot, counts, checks) = self
            .db
            .call(move |db| {
                let lot = db.get_lot(lot_id)?;
                let counts = db.open_blocking_counts(lot_id)?;
                let checks = db.gate_checks_for_lot(lot_id)?;
                Ok((lot, counts, checks))
            })
            .await?;
        let lot = lot.ok_or(FlowError::LotNotFound { lot_id })?;

        let blocking_by_phase: HashMap<u32, u32> = counts.into_iter().collect();

        let mut gate_status: HashMap<String, GateStatus> = TRANSITIONS
            .iter()
            .map(|t| (t.id.to_string(), GateStatus::NotStarted))
            .collect();
        for check in checks {
            gate_status.insert(check.transition_id, check.status);
        }

        let phases = PHASES
            .iter()
            .map(|phase| {
                let open_items = blocking_by_phase.get(&phase.ordinal).copied().unwrap_or(0);
                PhaseView {
                    ordinal: phase.ordinal,
                    id: phase.id,
                    name: phase.name,
                    status: display_status(phase.ordinal, lot.current_phase, open_items),
                    open_items,
                }
            })
            .collect();

        Ok(FlowStatus {
            lot_id,
            current_phase: lot.current_phase,
            blocking_by_phase,
            gate_status,
            phases,
        })
    }

    /// Attempt to move the lot one phase forward.
    ///
    /// Rejected (as `Blocked`, with the reason) when the source phase has
    /// open blocking items or a gate guarding a phase at or before the
    /// target is not `passed`. A write that loses the race against another
    /// advance returns `FlowError::Conflict`; the engine never retries on
    /// the caller's behalf.
    pub async fn advance_phase(&self, lot_id: i64) -> Result<AdvanceOutcome, FlowError> {
        let (lot, counts, checks) = self
            .db
            .call(move |db| {
                let lot = db.get_lot(lot_id)?;
                let counts = db.open_blocking_counts(lot_id)?;
                let checks = db.gate_checks_for_lot(lot_id)?;
                Ok((lot, counts, checks))
            })
            .await?;
        let lot = lot.ok_or(FlowError::LotNotFound { lot_id })?;

        if lot.current_phase >= phase_count() {
            return Ok(AdvanceOutcome::Blocked(BlockReason::SequenceComplete));
        }

        let source = lot.current_phase;
        let open_at_source: u32 = counts
            .iter()
            .filter(|(ordinal, _)| *ordinal == source)
            .map(|(_, count)| *count)
            .sum();
        if open_at_source > 0 {
            let phase_id = phase_by_ordinal(source).map(|p| p.id).unwrap_or("unknown");
            debug!(lot_id, phase = phase_id, open_at_source, "advance blocked by open items");
            return Ok(AdvanceOutcome::Blocked(BlockReason::OpenItems {
                phase_id: phase_id.to_string(),
                count: open_at_source,
            }));
        }

        let target = source + 1;
        let recorded: HashMap<&str, GateStatus> = checks
            .iter()
            .map(|c| (c.transition_id.as_str(), c.status))
            .collect();
        for transition in TRANSITIONS.iter().filter(|t| t.enters_ordinal <= target) {
            let status = recorded
                .get(transition.id)
                .copied()
                .unwrap_or(GateStatus::NotStarted);
            if status != GateStatus::Passed {
                debug!(lot_id, gate = transition.id, %status, "advance blocked by gate");
                return Ok(AdvanceOutcome::Blocked(BlockReason::GateNotPassed {
                    transition_id: transition.id.to_string(),
                    status,
                }));
            }
        }

        let progress = progress_for_phase(target);
        let won = self
            .db
            .call(move |db| db.advance_lot_phase(lot_id, source, target, progress))
            .await?;
        if !won {
            return Err(FlowError::Conflict {
                lot_id,
                expected_phase: source,
            });
        }

        info!(lot_id, from = source, to = target, "lot advanced");
        Ok(AdvanceOutcome::Advanced { new_phase: target })
    }
}
