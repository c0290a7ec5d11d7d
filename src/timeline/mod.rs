//! Per-site activity feed: append-only posting, live fan-out to
//! subscribers, and a bounded backlog for reconnects.
//!
//! The live stream is a broadcast channel with no durability; a subscriber
//! that lagged or reconnected re-reads the backlog instead of trusting the
//! stream.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::store::models::{Sender, TimelineMessage};
use crate::store::DbHandle;

pub struct TimelineHub {
    db: DbHandle,
    channels: Mutex<HashMap<i64, broadcast::Sender<TimelineMessage>>>,
    channel_capacity: usize,
    backlog_limit: usize,
}

impl TimelineHub {
    pub fn new(db: DbHandle, channel_capacity: usize, backlog_limit: usize) -> Self {
        Self {
            db,
            channels: Mutex::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
            backlog_limit,
        }
    }

    /// Persist a message and publish it to the site's live subscribers.
    ///
    /// The hub lock is held across persist and publish so subscribers see
    /// messages in store order.
    pub async fn post_message(
        &self,
        site_id: i64,
        lot_id: Option<i64>,
        sender: &Sender,
        content: &str,
    ) -> Result<i64> {
        let mut channels = self.channels.lock().await;

        // Prune the channel if every subscriber is gone.
        if channels
            .get(&site_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(&site_id);
        }

        let sender_owned = sender.clone();
        let content_owned = content.to_string();
        let message_id = self
            .db
            .call(move |db| {
                if !db.site_exists(site_id)? {
                    anyhow::bail!("site {} not found", site_id);
                }
                db.insert_message(site_id, lot_id, &sender_owned, &content_owned, &[])
            })
            .await?;

        if let Some(tx) = channels.get(&site_id) {
            let message = self.db.call(move |db| db.get_message(message_id)).await?;
            if let Some(message) = message {
                // Ignore error if every receiver vanished meanwhile.
                let _ = tx.send(message);
            }
        }

        debug!(site_id, message_id, "message posted");
        Ok(message_id)
    }

    /// Subscribe to a site's live stream. Callers filtering by lot drop
    /// messages for other lots themselves.
    pub async fn subscribe(&self, site_id: i64) -> broadcast::Receiver<TimelineMessage> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(site_id)
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }

    /// The most recent messages in persisted order, for reconnecting
    /// subscribers.
    pub async fn backlog(
        &self,
        site_id: i64,
        lot_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<TimelineMessage>> {
        let limit = limit.unwrap_or(self.backlog_limit);
        self.db
            .call(move |db| db.recent_messages(site_id, lot_id, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow;
    use crate::store::models::Role;
    use crate::store::StoreDb;

    fn sender() -> Sender {
        Sender {
            user_id: 7,
            role: Role::Worker,
            display_name: "Dana".to_string(),
        }
    }

    async fn setup() -> (TimelineHub, i64) {
        let db = StoreDb::new_in_memory().unwrap();
        db.seed_phases(&flow::PHASES).unwrap();
        let site = db.insert_site("Maple Creek", 1).unwrap();
        (TimelineHub::new(DbHandle::new(db), 16, 50), site)
    }

    #[tokio::test]
    async fn subscribers_receive_messages_in_post_order() {
        let (hub, site) = setup().await;
        let mut rx = hub.subscribe(site).await;

        for i in 0..3 {
            hub.post_message(site, None, &sender(), &format!("update {}", i))
                .await
                .unwrap();
        }

        for i in 0..3 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.content, format!("update {}", i));
        }
    }

    #[tokio::test]
    async fn posting_without_subscribers_succeeds() {
        let (hub, site) = setup().await;
        let id = hub
            .post_message(site, None, &sender(), "nobody listening")
            .await
            .unwrap();
        assert!(id > 0);
    }

    #[tokio::test]
    async fn unknown_site_is_rejected() {
        let (hub, _) = setup().await;
        assert!(hub
            .post_message(999, None, &sender(), "hello")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn backlog_serves_reconnecting_subscribers() {
        let (hub, site) = setup().await;
        for i in 0..5 {
            hub.post_message(site, None, &sender(), &format!("update {}", i))
                .await
                .unwrap();
        }

        let backlog = hub.backlog(site, None, Some(2)).await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].content, "update 3");
        assert_eq!(backlog[1].content, "update 4");
    }

    #[tokio::test]
    async fn backlog_filters_by_lot() {
        let (hub, site) = setup().await;
        hub.post_message(site, None, &sender(), "site wide").await.unwrap();
        hub.post_message(site, Some(41), &sender(), "lot scoped")
            .await
            .unwrap();

        let scoped = hub.backlog(site, Some(41), None).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].content, "lot scoped");
    }
}
