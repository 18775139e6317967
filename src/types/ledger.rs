//! The projected, human-readable ledger view. A pure function of the event
//! stream replay plus the compaction policy in the ledger store.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Handoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssumptionStatus {
    PendingReview,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub session_id: String,
    pub status: SessionStatus,
    pub phase: String,
    pub last_updated_ms: u64,
    pub tasks_completed: usize,
    pub tasks_total: usize,
    pub current_task: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub content: String,
    pub source: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assumption {
    pub content: String,
    pub source: String,
    pub rationale: String,
    pub status: AssumptionStatus,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Governance {
    pub directives: Vec<Directive>,
    pub assumptions: Vec<Assumption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTask {
    pub id: String,
    pub title: String,
    pub status: super::TaskStatus,
}

/// A bounded unit of work: at most one active epic at a time, at most 3 tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub title: String,
    pub request: String,
    pub status: EpicStatus,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub tasks: Vec<LedgerTask>,
    pub context: Vec<String>,
    pub progress_log: Vec<String>,
}

pub const MAX_EPIC_TASKS: usize = 3;
pub const MAX_ARCHIVE: usize = 5;
pub const MAX_ACTIVITY: usize = 10;

impl Epic {
    pub fn new(id: impl Into<String>, title: impl Into<String>, request: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            request: request.into(),
            status: EpicStatus::InProgress,
            created_at_ms: now_ms,
            completed_at_ms: None,
            tasks: Vec::new(),
            context: Vec::new(),
            progress_log: Vec::new(),
        }
    }

    /// Invariant: epic.tasks never exceeds `MAX_EPIC_TASKS`.
    pub fn push_task(&mut self, task: LedgerTask) {
        if self.tasks.len() < MAX_EPIC_TASKS {
            self.tasks.push(task);
        } else {
            tracing::warn!(epic = %self.id, "dropping task, epic already at max size");
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Learnings {
    pub patterns: Vec<String>,
    pub anti_patterns: Vec<String>,
    pub decisions: Vec<String>,
    pub preferences: Vec<String>,
}

impl Learnings {
    /// Duplicate content within the same typed list is rejected.
    pub fn push(&mut self, kind: &str, content: String) {
        let list = match kind {
            "pattern" => &mut self.patterns,
            "anti_pattern" => &mut self.anti_patterns,
            "decision" => &mut self.decisions,
            "preference" => &mut self.preferences,
            other => {
                tracing::warn!(kind = other, "unknown learning kind, dropping");
                return;
            }
        };
        if !list.iter().any(|existing| existing == &content) {
            list.push(content);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub decisions: Vec<String>,
    pub plan: Vec<String>,
    pub affected_files: Vec<String>,
    pub relevant_learnings: Vec<String>,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedEpic {
    pub epic: Epic,
    pub archived_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub meta: LedgerMeta,
    pub governance: Governance,
    pub epic: Option<Epic>,
    pub activity: VecDeque<String>,
    pub learnings: Learnings,
    pub handoff: Option<Handoff>,
    pub archive: VecDeque<ArchivedEpic>,
}

impl Ledger {
    pub fn new(session_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            meta: LedgerMeta {
                session_id: session_id.into(),
                status: SessionStatus::Active,
                phase: "INIT".to_string(),
                last_updated_ms: now_ms,
                tasks_completed: 0,
                tasks_total: 0,
                current_task: None,
            },
            governance: Governance::default(),
            epic: None,
            activity: VecDeque::new(),
            learnings: Learnings::default(),
            handoff: None,
            archive: VecDeque::new(),
        }
    }

    /// Invariant: activity retains only the most recent `MAX_ACTIVITY` entries.
    pub fn push_activity(&mut self, line: String) {
        if self.activity.len() >= MAX_ACTIVITY {
            self.activity.pop_front();
        }
        self.activity.push_back(line);
    }

    /// Invariant: archive retains only the most recent `MAX_ARCHIVE` epics,
    /// evicted FIFO.
    pub fn archive_current_epic(&mut self, now_ms: u64) {
        if let Some(epic) = self.epic.take() {
            if self.archive.len() >= MAX_ARCHIVE {
                self.archive.pop_front();
            }
            self.archive.push_back(ArchivedEpic { epic, archived_at_ms: now_ms });
        }
    }
}
