//! Bounded context snapshot handed to the classification collaborator.
//!
//! The snapshot caps the number of lots it describes so the prompt stays a
//! fixed size no matter how large a site grows.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::flow::phase_by_ordinal;
use crate::store::models::{LotStatus, Role, Sender};
use crate::store::DbHandle;

/// One line of lot context: the number humans use, where the lot stands.
#[derive(Debug, Clone)]
pub struct LotBrief {
    pub number: String,
    pub status: LotStatus,
    pub phase_name: &'static str,
}

#[derive(Debug, Clone)]
pub struct SiteSnapshot {
    pub site_name: String,
    pub lots: Vec<LotBrief>,
    pub sender_role: Role,
    pub sender_name: String,
    pub now: DateTime<Utc>,
}

impl SiteSnapshot {
    /// Load site name and up to `lot_limit` active lots.
    pub async fn gather(
        db: &DbHandle,
        site_id: i64,
        sender: &Sender,
        lot_limit: usize,
    ) -> Result<Self> {
        let (site, lots) = db
            .call(move |db| {
                let site = db.get_site(site_id)?;
                let lots = db.active_lots_for_site(site_id, lot_limit)?;
                Ok((site, lots))
            })
            .await?;

        let site_name = site.map(|s| s.name).unwrap_or_else(|| "unknown".to_string());
        let lots = lots
            .into_iter()
            .map(|lot| LotBrief {
                number: lot.number,
                status: lot.status,
                phase_name: phase_by_ordinal(lot.current_phase)
                    .map(|p| p.name)
                    .unwrap_or("Unknown"),
            })
            .collect();

        Ok(Self {
            site_name,
            lots,
            sender_role: sender.role,
            sender_name: sender.display_name.clone(),
            now: Utc::now(),
        })
    }

    /// Build the classification prompt for one message.
    pub fn classification_prompt(&self, message: &str) -> String {
        let mut prompt = String::new();
        prompt.push_str("You classify short updates posted to a construction site feed.\n\n");
        prompt.push_str(&format!("Site: {}\n", self.site_name));
        prompt.push_str(&format!(
            "Posted by: {} ({})\n",
            self.sender_name,
            self.sender_role.as_str()
        ));
        prompt.push_str(&format!("Time: {}\n", self.now.to_rfc3339()));

        if !self.lots.is_empty() {
            prompt.push_str("\nActive lots:\n");
            for lot in &self.lots {
                prompt.push_str(&format!(
                    "  lot {} ({}, phase: {})\n",
                    lot.number,
                    lot.status.as_str(),
                    lot.phase_name
                ));
            }
        }

        prompt.push_str(&format!("\nMessage:\n{}\n", message));
        prompt.push_str(
            "\nReply with one JSON object and nothing else:\n\
             {\n\
             \x20 \"event_type\": one of note | material_request | alert | calendar_event |\n\
             \x20                status_change | issue | inspection | milestone |\n\
             \x20                worker_arrival | worker_departure,\n\
             \x20 \"title\": short summary,\n\
             \x20 \"description\": one sentence,\n\
             \x20 \"confidence\": 0.0 to 1.0,\n\
             \x20 \"material\": {\"material\", \"quantity\", \"unit\", \"urgency\", \"lot_number\"} (material_request only),\n\
             \x20 \"calendar\": {\"title\", \"starts_at\", \"location\"} (calendar_event only),\n\
             \x20 \"status\": {\"lot_number\", \"status\"} (status_change only)\n\
             }\n\
             Lots are referenced by lot number. Use event_type \"note\" with low\n\
             confidence for plain chatter.\n",
        );
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow;
    use crate::store::StoreDb;

    fn sender() -> Sender {
        Sender {
            user_id: 3,
            role: Role::Operator,
            display_name: "Sam".to_string(),
        }
    }

    #[tokio::test]
    async fn snapshot_bounds_lot_count() {
        let db = StoreDb::new_in_memory().unwrap();
        db.seed_phases(&flow::PHASES).unwrap();
        let site = db.insert_site("Maple Creek", 1).unwrap();
        for i in 0..40 {
            db.insert_lot(site, &format!("{:02}", i), 1).unwrap();
        }
        let handle = DbHandle::new(db);

        let snapshot = SiteSnapshot::gather(&handle, site, &sender(), 30)
            .await
            .unwrap();
        assert_eq!(snapshot.lots.len(), 30);
        assert_eq!(snapshot.site_name, "Maple Creek");
    }

    #[tokio::test]
    async fn completed_lots_are_excluded() {
        let db = StoreDb::new_in_memory().unwrap();
        db.seed_phases(&flow::PHASES).unwrap();
        let site = db.insert_site("Maple Creek", 1).unwrap();
        let done = db.insert_lot(site, "01", 6).unwrap();
        db.set_lot_status(done, LotStatus::Completed).unwrap();
        db.insert_lot(site, "02", 2).unwrap();
        let handle = DbHandle::new(db);

        let snapshot = SiteSnapshot::gather(&handle, site, &sender(), 30)
            .await
            .unwrap();
        assert_eq!(snapshot.lots.len(), 1);
        assert_eq!(snapshot.lots[0].number, "02");
        assert_eq!(snapshot.lots[0].phase_name, "Walls");
    }

    #[test]
    fn prompt_includes_context_and_message() {
        let snapshot = SiteSnapshot {
            site_name: "Maple Creek".to_string(),
            lots: vec![LotBrief {
                number: "12".to_string(),
                status: LotStatus::InProgress,
                phase_name: "Walls",
            }],
            sender_role: Role::Worker,
            sender_name: "Dana".to_string(),
            now: Utc::now(),
        };
        let prompt = snapshot.classification_prompt("need rebar on 12");
        assert!(prompt.contains("Maple Creek"));
        assert!(prompt.contains("Dana (worker)"));
        assert!(prompt.contains("lot 12 (in_progress, phase: Walls)"));
        assert!(prompt.contains("need rebar on 12"));
        assert!(prompt.contains("\"event_type\""));
    }
}
