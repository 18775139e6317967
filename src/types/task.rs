//! The registry's supervised task entry.

use serde::{Deserialize, Serialize};

use super::{Complexity, SessionId, TaskId};

/// Lifecycle status of a supervised task. Status transitions only move
/// forward, except `{failed, timeout, stale} -> running` on retry, which
/// re-opens the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Stale,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: Option<SessionId>,
    pub agent_name: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub complexity: Complexity,
    pub last_heartbeat_ms: Option<u64>,
    pub parent_session_id: Option<SessionId>,
    pub ledger_task_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Caller-supplied fields when registering a new task; the registry fills in
/// defaults and bookkeeping fields.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub agent_name: String,
    pub prompt: String,
    pub parent_session_id: Option<SessionId>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub complexity: Option<Complexity>,
}

impl TaskDescriptor {
    pub fn new(agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            parent_session_id: None,
            max_retries: None,
            timeout_ms: None,
            complexity: None,
        }
    }
}
