//! Notification fan-out: resolve role-scoped recipients for an event,
//! batch their device tokens, and hand batches to the push transport.
//! Delivery is best-effort and at-most-once from this layer; the transport
//! may retry internally but that is opaque here.

pub mod router;
pub mod routing;
pub mod worker;

pub use router::NotificationRouter;
pub use routing::{app_names, channel_for, target_roles, RoleGroup};
pub use worker::spawn_notification_worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mediation::types::EventType;

/// One push payload addressed to a single device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    /// Channel hint for the client's notification grouping.
    pub channel: String,
}

/// Fire-and-forget batch sender. Returns whether the transport accepted
/// the batch; rejection is not retried here.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send_batch(&self, messages: &[PushMessage]) -> bool;
}

/// Transport that only logs. Used by the CLI, where no real push backend
/// is wired up.
pub struct LogTransport;

#[async_trait]
impl PushTransport for LogTransport {
    async fn send_batch(&self, messages: &[PushMessage]) -> bool {
        debug!(count = messages.len(), "push batch (log transport)");
        true
    }
}

/// A routing request, produced by the mediation pipeline and consumed by
/// the notification worker.
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    pub event_type: EventType,
    pub site_id: i64,
    /// The posting user never receives their own notification.
    pub exclude_user: Option<i64>,
    pub title: String,
    pub body: String,
}
