//! Parser for the classification collaborator's reply.
//!
//! The collaborator is asked for a single JSON object but is free-running
//! text underneath, so the reply may wrap the object in prose, code fences,
//! or nothing at all. Parsing is tolerant end to end: any shape we cannot
//! decode yields `None` and the pipeline substitutes the fallback result.
//!
//! ## Expected reply shape
//!
//! ```json
//! {
//!   "event_type": "material_request",
//!   "title": "Rebar needed on lot 12",
//!   "description": "Crew is short 40 sticks of #4 rebar",
//!   "confidence": 0.85,
//!   "material": {"material": "#4 rebar", "quantity": 40, "unit": "sticks", "lot_number": "12"}
//! }
//! ```

use serde::Deserialize;

use super::types::{
    CalendarExtraction, EventType, MaterialExtraction, MediationResult, StatusExtraction,
};
use crate::store::models::{LotStatus, Urgency};

/// Extract the outermost JSON object from text that may contain other
/// content, by brace counting.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    event_type: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    material: Option<RawMaterial>,
    #[serde(default)]
    calendar: Option<RawCalendar>,
    #[serde(default)]
    status: Option<RawStatus>,
}

#[derive(Debug, Deserialize)]
struct RawMaterial {
    material: String,
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    urgency: Option<String>,
    #[serde(default)]
    lot_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCalendar {
    title: String,
    #[serde(default)]
    starts_at: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(default)]
    lot_number: Option<String>,
    status: String,
}

/// Decode a collaborator reply into a mediation result.
///
/// Returns `None` when no JSON object is present, the JSON does not decode,
/// or the event type is not one we know; the caller substitutes the
/// fallback. Field-level sloppiness is absorbed instead: a missing title or
/// description falls back to the message text, an unknown urgency becomes
/// `normal`, an unknown lot status drops just the status payload, and
/// confidence is clamped into [0, 1].
pub fn parse_classification(reply: &str, original_message: &str) -> Option<MediationResult> {
    let json = extract_json_object(reply)?;
    let raw: RawClassification = serde_json::from_str(json).ok()?;
    let event_type: EventType = raw.event_type.parse().ok()?;

    let confidence = raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0);
    let title = raw
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| default_title(event_type));
    let description = raw
        .description
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| original_message.to_string());

    let material = raw.material.map(|m| MaterialExtraction {
        material: m.material,
        quantity: m.quantity,
        unit: m.unit,
        urgency: m
            .urgency
            .and_then(|u| u.parse::<Urgency>().ok())
            .unwrap_or_default(),
        lot_number: m.lot_number,
    });

    let calendar = raw.calendar.map(|c| CalendarExtraction {
        title: c.title,
        starts_at: c.starts_at,
        location: c.location,
    });

    let status_change = raw.status.and_then(|s| {
        let status = s.status.parse::<LotStatus>().ok()?;
        Some(StatusExtraction {
            lot_number: s.lot_number,
            status,
        })
    });

    Some(MediationResult {
        event_type,
        title,
        description,
        confidence,
        material,
        calendar,
        status_change,
    })
}

fn default_title(event_type: EventType) -> String {
    match event_type {
        EventType::Note => "Note",
        EventType::MaterialRequest => "Material request",
        EventType::Alert => "Alert",
        EventType::CalendarEvent => "Calendar event",
        EventType::StatusChange => "Status change",
        EventType::Issue => "Issue reported",
        EventType::Inspection => "Inspection",
        EventType::Milestone => "Milestone",
        EventType::WorkerArrival => "Crew arrival",
        EventType::WorkerDeparture => "Crew departure",
    }
    .to_string()
}
