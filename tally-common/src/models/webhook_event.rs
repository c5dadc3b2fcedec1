//! Audit ledger record for inbound webhook deliveries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing status of one delivery attempt.
///
/// A row is created as `Processing` and moves to exactly one terminal
/// state. Replays of the same provider delivery append a new row; rows
/// are never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Processing,
    Success,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Processing => "processing",
            WebhookStatus::Success => "success",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(WebhookStatus::Processing),
            "success" => Some(WebhookStatus::Success),
            "failed" => Some(WebhookStatus::Failed),
            _ => None,
        }
    }
}

/// One row per inbound HTTP delivery attempt, append-only by policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: String,
    pub event_type: String,
    /// SHA-256 of the raw body; payload contents are never stored here
    pub payload_sha256: String,
    pub signature_valid: bool,
    pub status: WebhookStatus,
    /// Human-review annotations: match rule used, duplicate-merge
    /// decisions, or the error on failure
    pub detail: Option<String>,
    pub received_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
