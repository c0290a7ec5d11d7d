//! Recipient resolution and batched dispatch for one event.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use super::routing::{app_names, channel_for, target_roles, RoleGroup};
use super::{NotifyRequest, PushMessage, PushTransport};
use crate::store::models::Role;
use crate::store::DbHandle;

#[derive(Clone)]
pub struct NotificationRouter {
    db: DbHandle,
    transport: Arc<dyn PushTransport>,
    batch_size: usize,
}

impl NotificationRouter {
    pub fn new(db: DbHandle, transport: Arc<dyn PushTransport>, batch_size: usize) -> Self {
        Self {
            db,
            transport,
            batch_size: batch_size.max(1),
        }
    }

    /// Resolve recipients for the event and dispatch push payloads in
    /// batches. Returns how many messages transport-accepted batches
    /// carried; a failed batch is logged and skipped, later batches still
    /// go out.
    pub async fn route(&self, request: &NotifyRequest) -> Result<usize> {
        let roles = target_roles(request.event_type);
        if roles.is_empty() {
            return Ok(0);
        }

        let site_id = request.site_id;
        let site = self.db.call(move |db| db.get_site(site_id)).await?;
        let Some(site) = site else {
            warn!(site_id, "notification for unknown site dropped");
            return Ok(0);
        };

        // Per role group: resolve user ids, then that group's relevant
        // devices. Tokens dedupe across groups.
        let mut tokens: BTreeSet<String> = BTreeSet::new();
        for role in roles {
            let role = *role;
            let org_id = site.org_id;
            let user_ids = self
                .db
                .call(move |db| match role {
                    RoleGroup::Operator => db.operator_user_ids(site_id),
                    RoleGroup::Monitor => db.member_user_ids(org_id, Role::Monitor),
                    RoleGroup::Worker => db.member_user_ids(org_id, Role::Worker),
                })
                .await?;

            let mut user_ids: Vec<i64> = user_ids
                .into_iter()
                .filter(|id| Some(*id) != request.exclude_user)
                .collect();
            user_ids.sort_unstable();
            user_ids.dedup();
            if user_ids.is_empty() {
                continue;
            }

            let apps: Vec<&'static str> = app_names(role).to_vec();
            let devices = self
                .db
                .call(move |db| db.devices_for_users(&user_ids, &apps))
                .await?;
            for device in devices {
                if let Some(token) = device.push_token {
                    tokens.insert(token);
                }
            }
        }

        if tokens.is_empty() {
            debug!(event = %request.event_type, site_id, "no push-capable recipients");
            return Ok(0);
        }

        let channel = channel_for(request.event_type);
        let messages: Vec<PushMessage> = tokens
            .into_iter()
            .map(|token| PushMessage {
                token,
                title: request.title.clone(),
                body: request.body.clone(),
                data: serde_json::json!({
                    "event_type": request.event_type.as_str(),
                    "site_id": request.site_id,
                }),
                channel: channel.to_string(),
            })
            .collect();

        let mut sent = 0;
        for batch in messages.chunks(self.batch_size) {
            if self.transport.send_batch(batch).await {
                sent += batch.len();
            } else {
                warn!(
                    event = %request.event_type,
                    site_id,
                    batch_len = batch.len(),
                    "push transport rejected batch"
                );
            }
        }
        Ok(sent)
    }
}
