//! Typed error hierarchy for the coordination core.
//!
//! Three top-level enums cover the three subsystems:
//! - `FlowError`: phase-gate engine failures (a blocked advance is NOT an
//!   error; it is the `AdvanceOutcome::Blocked` result)
//! - `MediationError`: mediation pipeline failures (an unparseable
//!   classification is NOT an error; it is the fallback result)
//! - `SyncError`: offline queue replay failures

use thiserror::Error;

/// Errors from the phase-gate engine.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Lot {lot_id} not found")]
    LotNotFound { lot_id: i64 },

    #[error("Lot {lot_id} advanced concurrently (expected phase {expected_phase}); re-read and retry")]
    Conflict { lot_id: i64, expected_phase: u32 },

    #[error("Unknown gate transition '{transition_id}'")]
    UnknownTransition { transition_id: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Errors from the mediation pipeline.
#[derive(Debug, Error)]
pub enum MediationError {
    #[error("Message {message_id} not found")]
    MessageNotFound { message_id: i64 },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Errors from offline queue replay.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Operation {op_id} failed to apply: {source}")]
    ApplyFailed {
        op_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Operation {op_id} has an undecodable payload: {reason}")]
    BadPayload { op_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
