//! Background flush loop for the offline queue.
//!
//! One flush runs at a time per client. The connectivity observer may flap;
//! a transition that arrives mid-flush does not restart the pass, it only
//! triggers a fresh check once the current pass finishes.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::queue::{apply_op, ApplyOutcome, OfflineQueue, QueueItem};
use crate::config::SyncSettings;
use crate::errors::SyncError;
use crate::store::DbHandle;

/// What one flush pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
    pub quarantined: usize,
}

pub struct SyncManager {
    db: DbHandle,
    queue: OfflineQueue,
    settings: SyncSettings,
    flush_lock: Mutex<()>,
    report_tx: watch::Sender<FlushReport>,
}

impl SyncManager {
    pub fn new(db: DbHandle, settings: SyncSettings) -> Self {
        let queue = OfflineQueue::new(db.clone());
        let (report_tx, _) = watch::channel(FlushReport::default());
        Self {
            db,
            queue,
            settings,
            flush_lock: Mutex::new(()),
            report_tx,
        }
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Observe flush completions.
    pub fn reports(&self) -> watch::Receiver<FlushReport> {
        self.report_tx.subscribe()
    }

    /// Drive flushes from a connectivity observer until it closes.
    pub async fn run(self: Arc<Self>, mut connectivity: watch::Receiver<bool>) {
        if *connectivity.borrow() {
            if let Err(e) = self.flush().await {
                warn!("initial flush failed: {e}");
            }
        }
        while connectivity.changed().await.is_ok() {
            let online = *connectivity.borrow_and_update();
            if !online {
                continue;
            }
            if let Err(e) = self.flush().await {
                warn!("flush failed: {e}");
            }
        }
    }

    /// Replay pending items strictly in captured order, one at a time.
    ///
    /// A failing item is retried on later flushes until its attempt count
    /// reaches the configured cap, then moved to quarantine so the rest of
    /// the queue can drain. While the item is still retryable the pass
    /// stops behind it, preserving order. A concurrent call while a pass is
    /// running returns an empty report instead of starting a second pass.
    pub async fn flush(&self) -> Result<FlushReport, SyncError> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!("flush already in progress, skipping");
            return Ok(FlushReport::default());
        };

        let mut report = FlushReport::default();
        let items = self.queue.pending().await?;
        for item in items {
            match self.apply_item(&item).await {
                Ok(outcome) => {
                    let item_id = item.id;
                    self.db
                        .call(move |db| db.delete_queue_item(item_id))
                        .await?;
                    if outcome == ApplyOutcome::AlreadyApplied {
                        debug!(op_id = %item.op_id, "op already applied by an earlier flush");
                    }
                    report.flushed += 1;
                }
                Err(e) => {
                    let item_id = item.id;
                    let attempts = self
                        .db
                        .call(move |db| db.record_queue_attempt(item_id))
                        .await?;
                    if attempts >= self.settings.max_attempts {
                        warn!(
                            op_id = %item.op_id,
                            attempts,
                            "quarantining persistently failing op: {e}"
                        );
                        self.db
                            .call(move |db| db.quarantine_queue_item(item_id))
                            .await?;
                        report.quarantined += 1;
                    } else {
                        debug!(op_id = %item.op_id, attempts, "op failed, will retry: {e}");
                        report.failed += 1;
                        break;
                    }
                }
            }
        }

        if report != FlushReport::default() {
            info!(
                flushed = report.flushed,
                failed = report.failed,
                quarantined = report.quarantined,
                "flush complete"
            );
        }
        let _ = self.report_tx.send(report);
        Ok(report)
    }

    async fn apply_item(&self, item: &QueueItem) -> Result<ApplyOutcome, SyncError> {
        let op = item.decode().map_err(|e| SyncError::BadPayload {
            op_id: item.op_id.clone(),
            reason: e.to_string(),
        })?;
        let op_id = item.op_id.clone();
        let result = self
            .db
            .call(move |db| Ok(apply_op(db, &op_id, &op)))
            .await?;
        result.map_err(|e| SyncError::ApplyFailed {
            op_id: item.op_id.clone(),
            source: e,
        })
    }
}
