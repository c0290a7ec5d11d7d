//! The mediation pipeline: classify one stored message, apply structured
//! side-effects, persist the interpretation, and maybe hand a notification
//! to the background worker.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::classifier::Classifier;
use super::context::SiteSnapshot;
use super::parser::parse_classification;
use super::types::{EventType, MediationResult};
use crate::config::MediationSettings;
use crate::errors::MediationError;
use crate::notify::NotifyRequest;
use crate::store::models::TimelineMessage;
use crate::store::{DbHandle, NewMaterialRequest};

pub struct Mediator {
    db: DbHandle,
    classifier: Arc<dyn Classifier>,
    notify_tx: Option<mpsc::Sender<NotifyRequest>>,
    settings: MediationSettings,
}

impl Mediator {
    pub fn new(db: DbHandle, classifier: Arc<dyn Classifier>, settings: MediationSettings) -> Self {
        Self {
            db,
            classifier,
            notify_tx: None,
            settings,
        }
    }

    /// Attach the channel feeding the notification worker.
    pub fn with_notifier(mut self, tx: mpsc::Sender<NotifyRequest>) -> Self {
        self.notify_tx = Some(tx);
        self
    }

    /// Mediate one message.
    ///
    /// A classification that fails or does not parse is not an error: the
    /// message keeps its content and gets the zero-confidence note result.
    /// Re-running on the same message id overwrites the stored
    /// interpretation and never duplicates side-effects.
    pub async fn mediate(&self, message_id: i64) -> Result<MediationResult, MediationError> {
        let message = self
            .db
            .call(move |db| db.get_message(message_id))
            .await?
            .ok_or(MediationError::MessageNotFound { message_id })?;

        let snapshot = SiteSnapshot::gather(
            &self.db,
            message.site_id,
            &message.sender,
            self.settings.context_lot_limit,
        )
        .await?;
        let prompt = snapshot.classification_prompt(&message.content);

        let result = match self.classifier.classify(&prompt).await {
            Ok(reply) => parse_classification(&reply, &message.content)
                .unwrap_or_else(|| {
                    debug!(message_id, "classification reply did not parse, using fallback");
                    MediationResult::fallback(&message.content)
                }),
            Err(e) => {
                warn!(message_id, "classification call failed, using fallback: {e:#}");
                MediationResult::fallback(&message.content)
            }
        };

        if result.confidence >= self.settings.extraction_floor {
            self.apply_side_effects(&message, &result).await?;
        }

        let interpretation = serde_json::to_string(&result)
            .map_err(|e| MediationError::Store(anyhow::anyhow!("encode interpretation: {}", e)))?;
        self.db
            .call(move |db| {
                db.attach_interpretation(message_id, &interpretation)?;
                Ok(())
            })
            .await?;

        if result.event_type != EventType::Note
            && result.confidence >= self.settings.confidence_threshold
        {
            self.enqueue_notification(&message, &result);
        }

        Ok(result)
    }

    async fn apply_side_effects(
        &self,
        message: &TimelineMessage,
        result: &MediationResult,
    ) -> Result<(), MediationError> {
        match result.event_type {
            EventType::MaterialRequest => {
                if let Some(extraction) = &result.material {
                    self.create_material_request(message, extraction.clone())
                        .await?;
                }
            }
            EventType::StatusChange => {
                if let Some(extraction) = &result.status_change {
                    let lot = self
                        .resolve_lot(message, extraction.lot_number.as_deref())
                        .await?;
                    if let Some(lot_id) = lot {
                        let status = extraction.status;
                        self.db
                            .call(move |db| {
                                db.set_lot_status(lot_id, status)?;
                                Ok(())
                            })
                            .await?;
                        info!(lot_id, status = status.as_str(), "lot status updated from message");
                    }
                }
            }
            EventType::Note
            | EventType::Alert
            | EventType::CalendarEvent
            | EventType::Issue
            | EventType::Inspection
            | EventType::Milestone
            | EventType::WorkerArrival
            | EventType::WorkerDeparture => {}
        }
        Ok(())
    }

    async fn create_material_request(
        &self,
        message: &TimelineMessage,
        extraction: super::types::MaterialExtraction,
    ) -> Result<(), MediationError> {
        let message_id = message.id;
        let existing = self
            .db
            .call(move |db| db.material_request_for_message(message_id))
            .await?;
        if existing.is_some() {
            debug!(message_id, "material request already extracted, skipping");
            return Ok(());
        }

        let lot_id = self
            .resolve_lot(message, extraction.lot_number.as_deref())
            .await?;
        let site_id = message.site_id;
        let notes = format!(
            "Extracted from site feed message #{}: {}",
            message.id, message.content
        );
        let request = NewMaterialRequest {
            site_id,
            lot_id,
            material: extraction.material,
            quantity: extraction.quantity,
            unit: extraction.unit,
            urgency: extraction.urgency,
            notes,
            source_message_id: Some(message.id),
        };
        let request_id = self
            .db
            .call(move |db| db.insert_material_request(&request))
            .await?;
        info!(message_id, request_id, "material request created from message");
        Ok(())
    }

    /// A human message names lots by number; fall back to the message's own
    /// lot scope when no number was extracted or it does not resolve.
    async fn resolve_lot(
        &self,
        message: &TimelineMessage,
        lot_number: Option<&str>,
    ) -> Result<Option<i64>, MediationError> {
        if let Some(number) = lot_number {
            let site_id = message.site_id;
            let number = number.to_string();
            let found = self
                .db
                .call(move |db| db.find_lot_by_number(site_id, &number))
                .await?;
            if let Some(lot) = found {
                return Ok(Some(lot.id));
            }
            debug!(site_id, ?lot_number, "extracted lot number did not resolve");
        }
        Ok(message.lot_id)
    }

    fn enqueue_notification(&self, message: &TimelineMessage, result: &MediationResult) {
        let Some(tx) = &self.notify_tx else {
            return;
        };
        let request = NotifyRequest {
            event_type: result.event_type,
            site_id: message.site_id,
            exclude_user: Some(message.sender.user_id),
            title: result.title.clone(),
            body: result.description.clone(),
        };
        if let Err(e) = tx.try_send(request) {
            warn!(
                message_id = message.id,
                event = %result.event_type,
                "notification dropped: {e}"
            );
        }
    }
}
