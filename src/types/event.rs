//! The durable event: the system's single source of truth.

use serde::{Deserialize, Serialize};

use super::{CheckpointId, CorrelationId, EventId, SessionId};

/// Closed taxonomy of event types the core interprets directly. `Other`
/// accepts anything produced by the Runtime's own vocabulary that the core
/// does not need to understand, so resume never fails on an unrecognized
/// but well-formed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionCreated,
    SessionResumed,
    SessionIdle,
    SessionError,
    AgentSpawned,
    AgentCompleted,
    AgentFailed,
    HandoffInitiated,
    HandoffCompleted,
    ContextSnapshot,
    ContextRestored,
    CheckpointRequested,
    CheckpointApproved,
    CheckpointRejected,
    HumanIntervention,
    HumanApproved,
    HumanRejected,
    LearningExtracted,
    ErrorRecovered,
    LedgerEpicCreated,
    LedgerEpicStarted,
    LedgerEpicCompleted,
    LedgerTaskCreated,
    LedgerTaskStarted,
    LedgerTaskCompleted,
    LedgerTaskFailed,
    LedgerTaskYielded,
    LedgerHandoffCreated,
    LedgerHandoffResumed,
    LedgerLearningExtracted,
    Other(String),
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Other(s) => write!(f, "{s}"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Closed tagged union of event payloads: every field access maps to a typed
/// variant per event type rather than a bare JSON bag; `Other` is the
/// forward-compatibility escape hatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    AgentSpawned {
        agent: String,
        parent_session_id: Option<SessionId>,
        prompt_prefix: String,
        prompt_length: usize,
    },
    AgentCompleted {
        agent: String,
        session_id: SessionId,
        result: String,
    },
    AgentFailed {
        agent: String,
        session_id: SessionId,
        reason: String,
    },
    CheckpointRequested {
        checkpoint_id: CheckpointId,
        decision_point: String,
        reason: String,
    },
    CheckpointApproved {
        checkpoint_id: CheckpointId,
        selected_option: String,
    },
    CheckpointRejected {
        checkpoint_id: CheckpointId,
        reason: String,
    },
    LearningExtracted {
        kind: String,
        content: String,
    },
    LedgerEpicCreated {
        id: String,
        title: String,
        request: String,
    },
    LedgerEpicStarted {
        id: String,
    },
    /// `success = false` represents `epic.failed` -- the closed taxonomy
    /// keeps one event type for both finalization outcomes.
    LedgerEpicCompleted {
        id: String,
        success: bool,
    },
    LedgerTaskCreated {
        id: String,
        title: String,
    },
    LedgerTaskStarted {
        id: String,
    },
    LedgerTaskCompleted {
        id: String,
        summary: Option<String>,
    },
    LedgerTaskFailed {
        id: String,
        error: Option<String>,
    },
    LedgerTaskYielded {
        id: String,
        reason: Option<String>,
    },
    LedgerHandoffCreated {
        decisions: Vec<String>,
        plan: Vec<String>,
        affected_files: Vec<String>,
        relevant_learnings: Vec<String>,
    },
    LedgerHandoffResumed,
    Other(serde_json::Value),
}

/// An immutable, append-only event. Offsets are strictly increasing within a
/// log; ids are globally unique within a correlation id; there is no
/// update-in-place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub offset: u64,
    pub id: EventId,
    pub event_type: EventType,
    pub timestamp_ms: u64,
    pub stream_id: SessionId,
    pub correlation_id: CorrelationId,
    pub actor: String,
    pub parent_event_id: Option<EventId>,
    pub payload: EventPayload,
    pub checkpoint: Option<super::checkpoint::Checkpoint>,
}

/// Caller-supplied fields for a new event; the stream assigns `offset`, `id`
/// and `timestamp_ms`.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub event_type: EventType,
    pub stream_id: SessionId,
    pub correlation_id: CorrelationId,
    pub actor: String,
    pub parent_event_id: Option<EventId>,
    pub payload: EventPayload,
    pub checkpoint: Option<super::checkpoint::Checkpoint>,
}

impl EventInput {
    pub fn new(
        event_type: EventType,
        stream_id: SessionId,
        correlation_id: CorrelationId,
        actor: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_type,
            stream_id,
            correlation_id,
            actor: actor.into(),
            parent_event_id: None,
            payload,
            checkpoint: None,
        }
    }
}
