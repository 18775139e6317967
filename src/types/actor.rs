//! The actor's in-memory phase/assumption/direction state. Owned by the
//! reducer; a derived durable artifact that may be reconstructed by replay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Planning,
    Validating,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Direction {
    pub goals: Vec<String>,
    pub constraints: Vec<String>,
    pub decisions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssumptionRecord {
    pub worker: String,
    pub assumed: String,
    pub confidence: f32,
    pub verified: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Spawned,
    Completed,
    Failed,
    Yielded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentEntry {
    pub status: SubAgentStatus,
    pub agent: String,
    pub spawned_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Coordinator memory for a single session. `event_offset` must always equal
/// the offset of the last event that updated this state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorState {
    pub phase: Phase,
    pub session_id: SessionId,
    pub parent_session_id: Option<SessionId>,
    pub root_session_id: SessionId,
    pub execution_stack: Vec<String>,
    pub direction: Direction,
    pub assumptions: Vec<AssumptionRecord>,
    pub sub_agents: HashMap<String, SubAgentEntry>,
    pub event_offset: u64,
    pub current_task: Option<String>,
    pub last_updated_ms: u64,
}

impl ActorState {
    pub fn new(session_id: SessionId, now_ms: u64) -> Self {
        let root_session_id = session_id.clone();
        Self {
            phase: Phase::Init,
            session_id,
            parent_session_id: None,
            root_session_id,
            execution_stack: Vec::new(),
            direction: Direction::default(),
            assumptions: Vec::new(),
            sub_agents: HashMap::new(),
            event_offset: 0,
            current_task: None,
            last_updated_ms: now_ms,
        }
    }

    /// At least 3 unverified assumptions, or any confidence below this
    /// threshold, should be surfaced to the user.
    pub const SURFACE_CONFIDENCE_THRESHOLD: f32 = 0.6;
    pub const SURFACE_UNVERIFIED_COUNT: usize = 3;

    pub fn should_surface_assumptions(&self) -> bool {
        let unverified = self.assumptions.iter().filter(|a| !a.verified).count();
        unverified >= Self::SURFACE_UNVERIFIED_COUNT
            || self
                .assumptions
                .iter()
                .any(|a| !a.verified && a.confidence < Self::SURFACE_CONFIDENCE_THRESHOLD)
    }
}

/// Maximum execution_stack depth before a spawn is rejected as a recursion
/// hazard (`RECURSION_DETECTED`).
pub const MAX_EXECUTION_STACK_DEPTH: usize = 10;
