//! Ledger Store & Projector: the projected human-readable view, advanced by
//! folding selected events, serialized to disk under an exclusive file lock.

pub mod markdown;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use parking_lot::Mutex;
use rand::Rng;

use crate::config::LedgerConfig;
use crate::time::now_ms;
use crate::types::{
    Assumption, AssumptionStatus, CheckpointId, Directive, Epic, EpicStatus, Event, EventPayload,
    EventType, Ledger, LedgerError, LedgerTask, SessionStatus, TaskStatus,
};

/// Owns the in-memory projection plus write-through to `LEDGER.md`. The
/// learning projection is coalesced by a debounce timer (§4.5); every other
/// mutation flushes immediately under the exclusive file lock.
pub struct LedgerStore {
    config: LedgerConfig,
    state: Mutex<Ledger>,
    learning_flush_generation: AtomicU64,
}

impl LedgerStore {
    /// Loads an existing projection from disk if present, otherwise starts a
    /// fresh one for `session_id`.
    pub fn load_or_new(config: LedgerConfig, session_id: impl Into<String>) -> Result<Self, LedgerError> {
        let ledger = match std::fs::read_to_string(&config.ledger_path) {
            Ok(text) => markdown::parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ledger::new(session_id, now_ms()),
            Err(e) => return Err(LedgerError::Io(e)),
        };
        Ok(Self {
            config,
            state: Mutex::new(ledger),
            learning_flush_generation: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> Ledger {
        self.state.lock().clone()
    }

    /// Write discipline: parse (already in memory) -> mutate -> serialize ->
    /// write under an exclusive advisory lock, retrying with randomized
    /// backoff up to `lock_retry_attempts` times.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let rendered = markdown::render(&self.state.lock());
        if let Some(parent) = self.config.ledger_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut attempt = 0;
        loop {
            let lock_path = self.config.ledger_path.with_extension("md.lock");
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)?;

            match lock_file.try_lock_exclusive() {
                Ok(()) => {
                    let result = self.write_atomic(&rendered);
                    let _ = lock_file.unlock();
                    return result;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    attempt += 1;
                    if attempt >= self.config.lock_retry_attempts {
                        return Err(LedgerError::LockTimeout {
                            attempts: attempt,
                        });
                    }
                    let backoff_ms = 10u64 * (1 << attempt.min(6)) + rand::thread_rng().gen_range(0..20);
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
                Err(e) => return Err(LedgerError::Io(e)),
            }
        }
    }

    fn write_atomic(&self, rendered: &str) -> Result<(), LedgerError> {
        let dir = self
            .config
            .ledger_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let temp = tempfile::NamedTempFile::new_in(&dir)?;
        std::fs::write(temp.path(), rendered.as_bytes())?;
        temp.persist(&self.config.ledger_path)
            .map_err(|e| LedgerError::Io(e.error))?;
        Ok(())
    }

    /// Schedules a single write after 250ms of quiescence; a burst of
    /// learning events collapses into one flush.
    fn schedule_debounced_flush(self: &Arc<Self>) {
        let generation = self.learning_flush_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        let debounce = Duration::from_millis(self.config.learning_debounce_ms);
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if this.learning_flush_generation.load(Ordering::SeqCst) == generation {
                if let Err(e) = this.flush() {
                    tracing::warn!(error = %e, "debounced ledger flush failed");
                }
            }
        });
    }

    // -- Direct mutation API, used by the spawner/actor processor and by the
    // replayed-event projector alike, so the two code paths can never drift. --

    pub fn epic_created(&self, id: impl Into<String>, title: impl Into<String>, request: impl Into<String>) {
        let mut ledger = self.state.lock();
        let epic = Epic::new(id, title, request, now_ms());
        ledger.epic = Some(epic);
        ledger.meta.status = SessionStatus::Active;
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn epic_started(&self, epic_id: &str) {
        let mut ledger = self.state.lock();
        if ledger.epic.as_ref().map(|e| e.id.as_str()) != Some(epic_id) {
            tracing::warn!(epic_id, "epic.started for unknown/non-active epic");
        }
        drop(ledger);
        self.flush_or_warn();
    }

    /// `success = true` -> `epic.completed`; `success = false` -> `epic.failed`
    /// (§4.8's two finalization outcomes collapse onto this single event).
    pub fn epic_completed(&self, epic_id: &str, success: bool) {
        let now = now_ms();
        let mut ledger = self.state.lock();
        if let Some(epic) = ledger.epic.as_mut() {
            if epic.id == epic_id {
                epic.status = if success { EpicStatus::Completed } else { EpicStatus::Failed };
                epic.completed_at_ms = Some(now);
            }
        }
        ledger.archive_current_epic(now);
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn task_created(&self, task_id: impl Into<String>, title: impl Into<String>) {
        let mut ledger = self.state.lock();
        let task = LedgerTask {
            id: task_id.into(),
            title: title.into(),
            status: TaskStatus::Pending,
        };
        if let Some(epic) = ledger.epic.as_mut() {
            epic.push_task(task);
        } else {
            tracing::warn!("task.created with no active epic");
        }
        ledger.meta.tasks_total += 1;
        drop(ledger);
        self.flush_or_warn();
    }

    fn set_task_status(&self, task_id: &str, status: TaskStatus) {
        let mut ledger = self.state.lock();
        let mut completed_delta = 0usize;
        if let Some(epic) = ledger.epic.as_mut() {
            if let Some(task) = epic.tasks.iter_mut().find(|t| t.id == task_id) {
                if status == TaskStatus::Completed && task.status != TaskStatus::Completed {
                    completed_delta = 1;
                }
                task.status = status;
            }
        }
        ledger.meta.tasks_completed += completed_delta;
        ledger.meta.current_task = Some(task_id.to_string());
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn task_started(&self, task_id: &str) {
        self.set_task_status(task_id, TaskStatus::Running);
    }

    pub fn task_completed(&self, task_id: &str, summary: Option<&str>) {
        self.set_task_status(task_id, TaskStatus::Completed);
        if let Some(summary) = summary {
            self.push_activity(format!("task {task_id} completed: {summary}"));
        }
    }

    pub fn task_failed(&self, task_id: &str, error: Option<&str>) {
        self.set_task_status(task_id, TaskStatus::Failed);
        if let Some(error) = error {
            self.push_activity(format!("task {task_id} failed: {error}"));
        }
    }

    pub fn task_yielded(&self, task_id: &str, reason: Option<&str>) {
        self.set_task_status(task_id, TaskStatus::Suspended);
        if let Some(reason) = reason {
            self.push_activity(format!("task {task_id} yielded: {reason}"));
        }
    }

    /// Pauses the active epic and appends an intervention line, used by the
    /// supervisor when a stuck task's runtime session is still busy.
    pub fn pause_for_intervention(&self, reason: &str) {
        let mut ledger = self.state.lock();
        ledger.meta.status = SessionStatus::Paused;
        if let Some(epic) = ledger.epic.as_mut() {
            epic.progress_log.push(format!("paused: {reason}"));
        }
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn handoff_created(
        &self,
        decisions: Vec<String>,
        plan: Vec<String>,
        affected_files: Vec<String>,
        relevant_learnings: Vec<String>,
    ) {
        let mut ledger = self.state.lock();
        ledger.meta.status = SessionStatus::Handoff;
        ledger.handoff = Some(crate::types::Handoff {
            decisions,
            plan,
            affected_files,
            relevant_learnings,
            created_at_ms: now_ms(),
        });
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn handoff_resumed(&self) {
        let mut ledger = self.state.lock();
        ledger.handoff = None;
        ledger.meta.status = SessionStatus::Active;
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn push_activity(&self, line: String) {
        let mut ledger = self.state.lock();
        ledger.push_activity(line);
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn phase_changed(&self, phase: &str) {
        let mut ledger = self.state.lock();
        ledger.meta.phase = phase.to_string();
        ledger.meta.last_updated_ms = now_ms();
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn add_directive(&self, content: impl Into<String>, source: impl Into<String>) {
        let mut ledger = self.state.lock();
        ledger.governance.directives.push(Directive {
            content: content.into(),
            source: source.into(),
            created_at_ms: now_ms(),
        });
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn add_assumption(&self, content: impl Into<String>, source: impl Into<String>, rationale: impl Into<String>) {
        let mut ledger = self.state.lock();
        ledger.governance.assumptions.push(Assumption {
            content: content.into(),
            source: source.into(),
            rationale: rationale.into(),
            status: AssumptionStatus::PendingReview,
            created_at_ms: now_ms(),
        });
        drop(ledger);
        self.flush_or_warn();
    }

    pub fn resolve_assumption(&self, content: &str, approved: bool) {
        let mut ledger = self.state.lock();
        if let Some(assumption) = ledger.governance.assumptions.iter_mut().find(|a| a.content == content) {
            assumption.status = if approved { AssumptionStatus::Approved } else { AssumptionStatus::Rejected };
        }
        drop(ledger);
        self.flush_or_warn();
    }

    /// Mandatory directives, prepended to every spawned agent's context.
    pub fn mandatory_directives(&self) -> Vec<String> {
        self.state
            .lock()
            .governance
            .directives
            .iter()
            .map(|d| d.content.clone())
            .collect()
    }

    /// Duplicate content within a typed list is rejected (`Learnings::push`).
    /// Flush is debounced: a burst of learning events collapses into one
    /// write after 250ms of quiescence.
    pub fn learning_extracted(self: &Arc<Self>, kind: &str, content: String) {
        self.state.lock().learnings.push(kind, content);
        self.schedule_debounced_flush();
    }

    /// Naive keyword-overlap retrieval across all four typed learning lists,
    /// capped at `max`.
    pub fn learnings_matching(&self, keywords: &[String], max: usize) -> Vec<String> {
        let ledger = self.state.lock();
        let all = ledger
            .learnings
            .patterns
            .iter()
            .chain(ledger.learnings.anti_patterns.iter())
            .chain(ledger.learnings.decisions.iter())
            .chain(ledger.learnings.preferences.iter());

        if keywords.is_empty() {
            return all.take(max).cloned().collect();
        }

        all.filter(|entry| {
            let lower = entry.to_lowercase();
            keywords.iter().any(|kw| lower.contains(kw.as_str()))
        })
        .take(max)
        .cloned()
        .collect()
    }

    fn flush_or_warn(&self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "ledger flush failed");
        }
    }

    /// Applies a single stream event to the projection, used identically by
    /// the real-time projector subscription and by crash recovery's replay
    /// fold -- "projecting a prefix then continuing is indistinguishable
    /// from projecting the whole" holds because both paths share this fn.
    pub fn project_event(self: &Arc<Self>, event: &Event) {
        match &event.payload {
            EventPayload::LedgerEpicCreated { id, title, request } => {
                self.epic_created(id.clone(), title.clone(), request.clone());
            }
            EventPayload::LedgerEpicStarted { id } => self.epic_started(id),
            EventPayload::LedgerEpicCompleted { id, success } => self.epic_completed(id, *success),
            EventPayload::LedgerTaskCreated { id, title } => {
                self.task_created(id.clone(), title.clone());
            }
            EventPayload::LedgerTaskStarted { id } => self.task_started(id),
            EventPayload::LedgerTaskCompleted { id, summary } => {
                self.task_completed(id, summary.as_deref());
            }
            EventPayload::LedgerTaskFailed { id, error } => {
                self.task_failed(id, error.as_deref());
            }
            EventPayload::LedgerTaskYielded { id, reason } => {
                self.task_yielded(id, reason.as_deref());
            }
            EventPayload::LedgerHandoffCreated {
                decisions,
                plan,
                affected_files,
                relevant_learnings,
            } => {
                self.handoff_created(decisions.clone(), plan.clone(), affected_files.clone(), relevant_learnings.clone());
            }
            EventPayload::LedgerHandoffResumed => self.handoff_resumed(),
            EventPayload::LearningExtracted { kind, content }
                if event.event_type == EventType::LedgerLearningExtracted =>
            {
                self.learning_extracted(kind, content.clone());
            }
            _ => {}
        }
    }

    /// Rebuilds the projection from a full, ordered event replay. Finalizes
    /// per §4.8: if every task in the active epic completed, the epic is
    /// marked completed; if every task failed, it is marked failed.
    pub fn rebuild_from_events(self: &Arc<Self>, events: &[Event]) {
        *self.state.lock() = Ledger::new("recovered", now_ms());
        for event in events {
            self.project_event(event);
        }
        self.finalize_epic_if_resolved();
    }

    fn finalize_epic_if_resolved(&self) {
        let mut ledger = self.state.lock();
        let now = now_ms();
        let Some(epic) = ledger.epic.as_mut() else { return };
        if epic.tasks.is_empty() || epic.status != EpicStatus::InProgress {
            return;
        }
        if epic.tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            epic.status = EpicStatus::Completed;
            epic.completed_at_ms = Some(now);
        } else if epic.tasks.iter().all(|t| t.status == TaskStatus::Failed) {
            epic.status = EpicStatus::Failed;
            epic.completed_at_ms = Some(now);
        }
    }

    pub fn active_checkpoint_ids_from_requests(events: &[Event]) -> Vec<CheckpointId> {
        let mut pending = Vec::new();
        for event in events {
            match event.event_type {
                EventType::CheckpointRequested => {
                    if let Some(checkpoint) = &event.checkpoint {
                        pending.push(checkpoint.id);
                    }
                }
                EventType::CheckpointApproved | EventType::CheckpointRejected => {
                    if let EventPayload::CheckpointApproved { checkpoint_id, .. }
                    | EventPayload::CheckpointRejected { checkpoint_id, .. } = &event.payload
                    {
                        pending.retain(|id| id != checkpoint_id);
                    }
                }
                _ => {}
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> Arc<LedgerStore> {
        let mut config = LedgerConfig::default();
        config.ledger_path = dir.join("LEDGER.md");
        Arc::new(LedgerStore::load_or_new(config, "session-1").unwrap())
    }

    #[test]
    fn epic_tasks_never_exceed_three() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.epic_created("epic-1", "Ship feature", "do the thing");
        for i in 0..5 {
            store.task_created(format!("t{i}"), format!("task {i}"));
        }
        assert_eq!(store.snapshot().epic.unwrap().tasks.len(), 3);
    }

    #[test]
    fn archive_retains_only_five_most_recent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        for i in 0..8 {
            store.epic_created(format!("epic-{i}"), "title", "request");
            store.epic_completed(&format!("epic-{i}"), true);
        }
        assert_eq!(store.snapshot().archive.len(), 5);
    }

    #[test]
    fn duplicate_learning_content_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.state.lock().learnings.push("decision", "use postgres".into());
        store.state.lock().learnings.push("decision", "use postgres".into());
        assert_eq!(store.snapshot().learnings.decisions.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replaying_a_prefix_then_the_rest_matches_replaying_everything() {
        use crate::types::{CorrelationId, EventId, SessionId};

        let mk = |n: u64, t: EventType, p: EventPayload| Event {
            offset: n,
            id: EventId::new(&CorrelationId::new(), 0, n),
            event_type: t,
            timestamp_ms: 0,
            stream_id: SessionId::new(),
            correlation_id: CorrelationId::new(),
            actor: "test".into(),
            parent_event_id: None,
            payload: p,
            checkpoint: None,
        };

        let events = vec![
            mk(
                0,
                EventType::LedgerEpicCreated,
                EventPayload::LedgerEpicCreated { id: "e1".into(), title: "t".into(), request: "r".into() },
            ),
            mk(
                1,
                EventType::LedgerTaskCreated,
                EventPayload::LedgerTaskCreated { id: "t1".into(), title: "task1".into() },
            ),
            mk(2, EventType::LedgerTaskStarted, EventPayload::LedgerTaskStarted { id: "t1".into() }),
            mk(3, EventType::LedgerTaskCompleted, EventPayload::LedgerTaskCompleted { id: "t1".into(), summary: None }),
        ];

        let dir1 = tempdir().unwrap();
        let whole = store(dir1.path());
        whole.rebuild_from_events(&events);

        let dir2 = tempdir().unwrap();
        let prefixed = store(dir2.path());
        prefixed.rebuild_from_events(&events[..2]);
        for event in &events[2..] {
            prefixed.project_event(event);
        }

        assert_eq!(whole.snapshot().epic.unwrap().tasks[0].status, prefixed.snapshot().epic.unwrap().tasks[0].status);
    }
}
