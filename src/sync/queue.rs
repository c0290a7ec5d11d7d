//! Durable client-side queue of writes captured while offline.
//!
//! Each captured operation gets a client-generated op id. Replay claims the
//! id in the store's applied-op ledger inside the same transaction as the
//! write, so a flush interrupted and retried applies nothing twice.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::transition_by_id;
use crate::store::models::{GateStatus, MaterialRequestStatus, Sender, Urgency};
use crate::store::{DbHandle, NewMaterialRequest, StoreDb};

/// The closed set of writes a disconnected client may capture.
///
/// Phase advances are deliberately absent: they require live gate
/// evaluation, and replaying one recorded hours earlier could skip a gate
/// that failed in the meantime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueuedOp {
    PostMessage {
        site_id: i64,
        lot_id: Option<i64>,
        sender: Sender,
        content: String,
    },
    CloseBlockingItem {
        item_id: i64,
    },
    UpsertGateCheck {
        lot_id: i64,
        transition_id: String,
        status: GateStatus,
    },
    CreateMaterialRequest {
        site_id: i64,
        lot_id: Option<i64>,
        material: String,
        quantity: Option<f64>,
        unit: Option<String>,
        urgency: Urgency,
    },
    UpdateMaterialStatus {
        request_id: i64,
        status: MaterialRequestStatus,
    },
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub op_id: String,
    pub payload: String,
    pub captured_at: String,
    pub attempts: u32,
}

impl QueueItem {
    pub fn decode(&self) -> Result<QueuedOp, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The op id was already claimed by an earlier flush.
    AlreadyApplied,
}

/// Apply one queued operation under its idempotency key.
pub fn apply_op(db: &StoreDb, op_id: &str, op: &QueuedOp) -> Result<ApplyOutcome> {
    let claimed = db.run_idempotent(op_id, |db| match op {
        QueuedOp::PostMessage {
            site_id,
            lot_id,
            sender,
            content,
        } => {
            if !db.site_exists(*site_id)? {
                anyhow::bail!("site {} not found", site_id);
            }
            db.insert_message(*site_id, *lot_id, sender, content, &[])?;
            Ok(())
        }
        QueuedOp::CloseBlockingItem { item_id } => {
            if !db.blocking_item_exists(*item_id)? {
                anyhow::bail!("blocking item {} not found", item_id);
            }
            // Already-closed is fine; the supervisor's intent is satisfied.
            db.close_blocking_item(*item_id)?;
            Ok(())
        }
        QueuedOp::UpsertGateCheck {
            lot_id,
            transition_id,
            status,
        } => {
            if transition_by_id(transition_id).is_none() {
                anyhow::bail!("unknown gate transition '{}'", transition_id);
            }
            if db.get_lot(*lot_id)?.is_none() {
                anyhow::bail!("lot {} not found", lot_id);
            }
            db.upsert_gate_check(*lot_id, transition_id, *status)
        }
        QueuedOp::CreateMaterialRequest {
            site_id,
            lot_id,
            material,
            quantity,
            unit,
            urgency,
        } => {
            if !db.site_exists(*site_id)? {
                anyhow::bail!("site {} not found", site_id);
            }
            db.insert_material_request(&NewMaterialRequest {
                site_id: *site_id,
                lot_id: *lot_id,
                material: material.clone(),
                quantity: *quantity,
                unit: unit.clone(),
                urgency: *urgency,
                notes: String::new(),
                source_message_id: None,
            })?;
            Ok(())
        }
        QueuedOp::UpdateMaterialStatus { request_id, status } => {
            db.update_material_status(*request_id, *status)
        }
    })?;

    Ok(if claimed {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::AlreadyApplied
    })
}

/// Handle to the durable queue. Enqueue acknowledges as soon as the row is
/// written locally; the caller does not wait for replay.
#[derive(Clone)]
pub struct OfflineQueue {
    db: DbHandle,
}

impl OfflineQueue {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn enqueue(&self, op: QueuedOp) -> Result<String> {
        let op_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&op)?;
        let op_id_for_insert = op_id.clone();
        self.db
            .call(move |db| db.enqueue_offline_op(&op_id_for_insert, &payload))
            .await?;
        Ok(op_id)
    }

    /// Items awaiting replay, in captured order.
    pub async fn pending(&self) -> Result<Vec<QueueItem>> {
        self.items(false).await
    }

    /// Items set aside after exhausting their retries.
    pub async fn quarantined(&self) -> Result<Vec<QueueItem>> {
        self.items(true).await
    }

    async fn items(&self, quarantined: bool) -> Result<Vec<QueueItem>> {
        let rows = self
            .db
            .call(move |db| db.queue_items(quarantined))
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, op_id, payload, captured_at, attempts)| QueueItem {
                id,
                op_id,
                payload,
                captured_at,
                attempts,
            })
            .collect())
    }
}
