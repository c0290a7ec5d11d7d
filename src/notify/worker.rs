//! Background worker that drains routing requests off a bounded channel.
//!
//! Mediation hands requests over and returns immediately; a slow or failing
//! transport never stalls the request path. The worker exits when every
//! sender is dropped.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{NotificationRouter, NotifyRequest};

pub fn spawn_notification_worker(
    router: NotificationRouter,
    mut rx: mpsc::Receiver<NotifyRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match router.route(&request).await {
                Ok(sent) => {
                    info!(event = %request.event_type, site_id = request.site_id, sent, "notification routed");
                }
                Err(e) => {
                    warn!(event = %request.event_type, site_id = request.site_id, "notification routing failed: {e:#}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow;
    use crate::mediation::types::EventType;
    use crate::notify::{PushMessage, PushTransport};
    use crate::store::{DbHandle, StoreDb};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTransport {
        batches: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PushTransport for CountingTransport {
        async fn send_batch(&self, _messages: &[PushMessage]) -> bool {
            self.batches.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn worker_drains_queue_and_exits_on_close() {
        let db = StoreDb::new_in_memory().unwrap();
        db.seed_phases(&flow::PHASES).unwrap();
        let site = db.insert_site("Maple Creek", 1).unwrap();
        db.upsert_site_assignment(site, 1, true).unwrap();
        db.upsert_device(1, "office", Some("tok"), true).unwrap();

        let transport = Arc::new(CountingTransport {
            batches: AtomicUsize::new(0),
        });
        let router = NotificationRouter::new(DbHandle::new(db), transport.clone(), 100);
        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_notification_worker(router, rx);

        for _ in 0..3 {
            tx.send(NotifyRequest {
                event_type: EventType::MaterialRequest,
                site_id: site,
                exclude_user: None,
                title: "t".into(),
                body: "b".into(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        assert_eq!(transport.batches.load(Ordering::SeqCst), 3);
    }
}
