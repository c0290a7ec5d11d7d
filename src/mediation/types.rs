//! Typed events produced by classifying free-form site chatter.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::models::{LotStatus, Urgency};

/// Closed set of event kinds a message can mediate into. Routing and
/// side-effect dispatch match on this exhaustively, so an unhandled kind is
/// a compile error rather than a silent no-op.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Note,
    MaterialRequest,
    Alert,
    CalendarEvent,
    StatusChange,
    Issue,
    Inspection,
    Milestone,
    WorkerArrival,
    WorkerDeparture,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::MaterialRequest => "material_request",
            Self::Alert => "alert",
            Self::CalendarEvent => "calendar_event",
            Self::StatusChange => "status_change",
            Self::Issue => "issue",
            Self::Inspection => "inspection",
            Self::Milestone => "milestone",
            Self::WorkerArrival => "worker_arrival",
            Self::WorkerDeparture => "worker_departure",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(Self::Note),
            "material_request" => Ok(Self::MaterialRequest),
            "alert" => Ok(Self::Alert),
            "calendar_event" => Ok(Self::CalendarEvent),
            "status_change" => Ok(Self::StatusChange),
            "issue" => Ok(Self::Issue),
            "inspection" => Ok(Self::Inspection),
            "milestone" => Ok(Self::Milestone),
            "worker_arrival" => Ok(Self::WorkerArrival),
            "worker_departure" => Ok(Self::WorkerDeparture),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured extraction for a detected material request. Lots are referred
/// to by the number humans use, resolved against the site later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaterialExtraction {
    pub material: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub lot_number: Option<String>,
}

/// Structured extraction for a detected calendar entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalendarExtraction {
    pub title: String,
    #[serde(default)]
    pub starts_at: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Structured extraction for a detected lot status change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusExtraction {
    #[serde(default)]
    pub lot_number: Option<String>,
    pub status: LotStatus,
}

/// Output of classifying one timeline message. Attached to exactly one
/// message; never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediationResult {
    pub event_type: EventType,
    pub title: String,
    pub description: String,
    /// In [0, 1]. Zero means the fallback path: nothing was extracted.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<MaterialExtraction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar: Option<CalendarExtraction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_change: Option<StatusExtraction>,
}

impl MediationResult {
    /// The uninterpreted terminal state: the message still persists, shown
    /// as a plain note carrying its original text.
    pub fn fallback(original: &str) -> Self {
        Self {
            event_type: EventType::Note,
            title: "Note".to_string(),
            description: original.to_string(),
            confidence: 0.0,
            material: None,
            calendar: None,
            status_change: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.event_type == EventType::Note && self.confidence == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_roundtrip() {
        for s in [
            "note",
            "material_request",
            "alert",
            "calendar_event",
            "status_change",
            "issue",
            "inspection",
            "milestone",
            "worker_arrival",
            "worker_departure",
        ] {
            let event: EventType = s.parse().unwrap();
            assert_eq!(event.as_str(), s);
        }
        assert!("coffee_break".parse::<EventType>().is_err());
    }

    #[test]
    fn fallback_keeps_original_text() {
        let result = MediationResult::fallback("doing fine today");
        assert!(result.is_fallback());
        assert_eq!(result.event_type, EventType::Note);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.description, "doing fine today");
    }

    #[test]
    fn result_serializes_without_empty_payloads() {
        let json = serde_json::to_string(&MediationResult::fallback("hi")).unwrap();
        assert!(!json.contains("material"));
        assert!(!json.contains("calendar"));
        let back: MediationResult = serde_json::from_str(&json).unwrap();
        assert!(back.is_fallback());
    }
}
