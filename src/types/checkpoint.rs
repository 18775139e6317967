//! HITL approval requests.

use serde::{Deserialize, Serialize};

use super::{CheckpointId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointOption {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub stream_id: SessionId,
    pub decision_point: String,
    pub options: Vec<CheckpointOption>,
    pub requested_by: String,
    pub requested_at_ms: u64,
    pub expires_at_ms: u64,
    pub approved_by: Option<String>,
    pub approved_at_ms: Option<u64>,
    pub selected_option: Option<String>,
    pub rejected_reason: Option<String>,
    pub status: CheckpointStatus,
}
