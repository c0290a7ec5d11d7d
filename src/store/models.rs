use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub org_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    NotStarted,
    InProgress,
    Delayed,
    Completed,
    OnHold,
}

impl LotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::OnHold => "on_hold",
        }
    }
}

impl FromStr for LotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "delayed" => Ok(Self::Delayed),
            "completed" => Ok(Self::Completed),
            "on_hold" => Ok(Self::OnHold),
            _ => Err(format!("Invalid lot status: {}", s)),
        }
    }
}

/// One house/unit within a site. `current_phase` is an ordinal into the
/// fixed phase catalog; `progress_percentage` is derived from it on every
/// successful advance, never set directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub id: i64,
    pub site_id: i64,
    /// Lot number as humans refer to it on site (e.g. "12", "14B").
    pub number: String,
    pub status: LotStatus,
    pub current_phase: u32,
    pub progress_percentage: u8,
    pub created_at: String,
}

/// An open issue pinned to a (lot, phase) pair. While at least one is open
/// at the lot's active phase, the lot cannot advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingItem {
    pub id: i64,
    pub lot_id: i64,
    pub phase_ordinal: u32,
    pub title: String,
    pub open: bool,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    NotStarted,
    InProgress,
    Passed,
    Failed,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for GateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid gate status: {}", s)),
        }
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded checkpoint for one transition of the gate catalog on one lot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateCheck {
    pub id: i64,
    pub lot_id: i64,
    pub transition_id: String,
    pub status: GateStatus,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Worker,
    Monitor,
    Operator,
    Inspector,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Monitor => "monitor",
            Self::Operator => "operator",
            Self::Inspector => "inspector",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Self::Worker),
            "monitor" => Ok(Self::Monitor),
            "operator" => Ok(Self::Operator),
            "inspector" => Ok(Self::Inspector),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Who posted a timeline message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sender {
    pub user_id: i64,
    pub role: Role,
    pub display_name: String,
}

/// Append-only site activity entry. Content is immutable once written; the
/// only permitted mutation is attaching (or replacing) the interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineMessage {
    pub id: i64,
    pub site_id: i64,
    pub lot_id: Option<i64>,
    pub sender: Sender,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Serialized MediationResult, attached after the fact.
    pub ai_interpretation: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid urgency: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MaterialRequestStatus {
    Pending,
    Acknowledged,
    InTransit,
    Delivered,
    Cancelled,
}

impl MaterialRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Acknowledged => 1,
            Self::InTransit => 2,
            Self::Delivered => 3,
            Self::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Transitions only move forward through the lifecycle. Cancellation is
    /// reachable from any non-terminal state.
    pub fn can_transition_to(&self, to: MaterialRequestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Self::Cancelled => true,
            _ => to.rank() > self.rank(),
        }
    }
}

impl FromStr for MaterialRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "acknowledged" => Ok(Self::Acknowledged),
            "in_transit" => Ok(Self::InTransit),
            "delivered" => Ok(Self::Delivered),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid material request status: {}", s)),
        }
    }
}

/// Lifecycle record for requested material. Each transition stamps its own
/// timestamp column so the delivery timeline can be reconstructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialRequest {
    pub id: i64,
    pub site_id: i64,
    pub lot_id: Option<i64>,
    pub material: String,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub urgency: Urgency,
    pub status: MaterialRequestStatus,
    pub notes: String,
    /// Set when the request was extracted from a timeline message.
    pub source_message_id: Option<i64>,
    pub requested_at: String,
    pub acknowledged_at: Option<String>,
    pub in_transit_at: Option<String>,
    pub delivered_at: Option<String>,
    pub cancelled_at: Option<String>,
}

/// One push-capable client. At most one row per (user_id, app_name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub user_id: i64,
    pub app_name: String,
    pub push_token: Option<String>,
    pub push_enabled: bool,
    pub last_active_at: String,
}
