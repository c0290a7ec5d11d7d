//! Offline queue and sync: capture writes while disconnected, acknowledge
//! immediately, replay in order with idempotency once connectivity returns.

pub mod manager;
pub mod queue;

pub use manager::{FlushReport, SyncManager};
pub use queue::{apply_op, ApplyOutcome, OfflineQueue, QueueItem, QueuedOp};
