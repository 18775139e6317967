//! Task Registry: the authoritative in-memory index of supervised tasks.

use dashmap::DashMap;

use crate::config::RegistryConfig;
use crate::time::now_ms;
use crate::types::{Ledger, RegistryError, SessionId, Task, TaskDescriptor, TaskId, TaskStatus};

#[derive(Debug, Clone, Default)]
pub struct RegistrySummary {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub stale: usize,
    pub suspended: usize,
}

/// Wraps a `DashMap` so independent per-task status updates don't contend on
/// a single global lock.
pub struct TaskRegistry {
    config: RegistryConfig,
    tasks: DashMap<TaskId, Task>,
}

impl TaskRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            tasks: DashMap::new(),
        }
    }

    /// Creates a `pending` entry; seeds component defaults.
    pub fn register(&self, desc: TaskDescriptor) -> TaskId {
        let id = TaskId::new();
        let now = now_ms();
        let task = Task {
            id,
            session_id: None,
            agent_name: desc.agent_name,
            prompt: desc.prompt,
            status: TaskStatus::Pending,
            created_at_ms: now,
            started_at_ms: None,
            completed_at_ms: None,
            retry_count: 0,
            max_retries: desc.max_retries.unwrap_or(self.config.default_max_retries),
            timeout_ms: desc.timeout_ms.unwrap_or(self.config.default_timeout_ms),
            complexity: desc.complexity.unwrap_or_default(),
            last_heartbeat_ms: None,
            parent_session_id: desc.parent_session_id,
            ledger_task_id: None,
            result: None,
            error: None,
        };
        self.tasks.insert(id, task);
        tracing::info!(task_id = %id, "registered task");
        id
    }

    /// Inserts an already-constructed task (used by crash recovery to
    /// hydrate entries straight from the projected ledger).
    pub fn insert(&self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    /// Rehydrates registry entries from the projected ledger's active epic
    /// after a crash, so the supervisor's tick loop has something to act on
    /// before the full event replay catches up. Terminal tasks (completed,
    /// failed) are skipped; the event log remains the source of truth for
    /// history.
    pub fn load_from_ledger(&self, ledger: &Ledger) {
        let Some(epic) = &ledger.epic else { return };
        for ledger_task in &epic.tasks {
            if matches!(ledger_task.status, TaskStatus::Completed) {
                continue;
            }
            let id = TaskId::new();
            let now = now_ms();
            let status = match ledger_task.status {
                TaskStatus::Running => TaskStatus::Stale,
                other => other,
            };
            let task = Task {
                id,
                session_id: None,
                agent_name: ledger_task.title.clone(),
                prompt: String::new(),
                status,
                created_at_ms: now,
                started_at_ms: None,
                completed_at_ms: None,
                retry_count: 0,
                max_retries: self.config.default_max_retries,
                timeout_ms: self.config.default_timeout_ms,
                complexity: Default::default(),
                last_heartbeat_ms: None,
                parent_session_id: None,
                ledger_task_id: Some(ledger_task.id.clone()),
                result: None,
                error: None,
            };
            tracing::info!(task_id = %id, ledger_task_id = %ledger_task.id, "rehydrated task from ledger");
            self.insert(task);
        }
    }

    fn is_forward_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (from, to) {
            (a, b) if a == b => true,
            (Pending, Running) => true,
            (Running, Completed | Failed | Timeout | Stale | Suspended) => true,
            // Retry: {Failed, Timeout, Stale} -> Running re-opens the task.
            (Failed | Timeout | Stale, Running) => true,
            (Suspended, Running) => true,
            _ => false,
        }
    }

    pub fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .tasks
            .get_mut(&id)
            .ok_or(RegistryError::TaskNotFound { task_id: id })?;

        if !Self::is_forward_transition(entry.status, status) {
            return Err(RegistryError::InvalidTransition {
                task_id: id,
                from: format!("{:?}", entry.status),
                to: format!("{:?}", status),
            });
        }

        let now = now_ms();
        match status {
            TaskStatus::Running if entry.status != TaskStatus::Running => {
                entry.started_at_ms = Some(now);
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout => {
                entry.completed_at_ms = Some(now);
            }
            _ => {}
        }
        entry.status = status;
        if result.is_some() {
            entry.result = result;
        }
        if error.is_some() {
            entry.error = error;
        }
        Ok(())
    }

    /// No-op for an unknown id; unknown ids are warnings, never faults.
    pub fn heartbeat(&self, id: TaskId) {
        match self.tasks.get_mut(&id) {
            Some(mut entry) => entry.last_heartbeat_ms = Some(now_ms()),
            None => tracing::warn!(task_id = %id, "heartbeat for unknown task"),
        }
    }

    /// Rebinds the task to a new runtime session on retry; resets
    /// `started_at`.
    pub fn update_session_id(&self, id: TaskId, new_session_id: SessionId) {
        match self.tasks.get_mut(&id) {
            Some(mut entry) => {
                entry.session_id = Some(new_session_id);
                entry.started_at_ms = Some(now_ms());
            }
            None => tracing::warn!(task_id = %id, "update_session_id for unknown task"),
        }
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).map(|e| e.clone())
    }

    /// Tasks currently bound to `session_id`, used by recursive abort to find
    /// which registry entries belong to a session being cancelled.
    pub fn by_session_id(&self, session_id: &SessionId) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|e| e.session_id.as_ref() == Some(session_id))
            .map(|e| e.clone())
            .collect()
    }

    /// Forces a task straight to a terminal, cleanup-eligible status
    /// regardless of its current status, for recursive-abort cancellation
    /// where the normal forward-only transition rules don't apply -- an
    /// aborted task is terminal no matter what it was doing.
    pub fn force_terminal(&self, id: TaskId, status: TaskStatus, error: Option<String>) {
        if let Some(mut entry) = self.tasks.get_mut(&id) {
            entry.status = status;
            entry.completed_at_ms = Some(now_ms());
            if error.is_some() {
                entry.error = error;
            }
        }
    }

    pub fn by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.clone())
            .collect()
    }

    /// `running && now - started_at > timeout_ms`.
    pub fn timed_out(&self) -> Vec<Task> {
        let now = now_ms();
        self.tasks
            .iter()
            .filter(|e| {
                e.status == TaskStatus::Running
                    && e.started_at_ms
                        .map(|started| now.saturating_sub(started) > e.timeout_ms)
                        .unwrap_or(false)
            })
            .map(|e| e.clone())
            .collect()
    }

    /// `running && now - max(last_heartbeat, started_at) > stuck_threshold`.
    pub fn stuck(&self, stuck_threshold_ms: u64) -> Vec<Task> {
        let now = now_ms();
        self.tasks
            .iter()
            .filter(|e| {
                if e.status != TaskStatus::Running {
                    return false;
                }
                let reference = match (e.last_heartbeat_ms, e.started_at_ms) {
                    (Some(hb), Some(started)) => hb.max(started),
                    (Some(hb), None) => hb,
                    (None, Some(started)) => started,
                    (None, None) => return false,
                };
                now.saturating_sub(reference) > stuck_threshold_ms
            })
            .map(|e| e.clone())
            .collect()
    }

    /// `(failed|timeout) && retry_count < max_retries`.
    pub fn retriable(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|e| {
                matches!(e.status, TaskStatus::Failed | TaskStatus::Timeout) && e.retry_count < e.max_retries
            })
            .map(|e| e.clone())
            .collect()
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for entry in self.tasks.iter() {
            match entry.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Timeout => summary.timeout += 1,
                TaskStatus::Stale => summary.stale += 1,
                TaskStatus::Suspended => summary.suspended += 1,
            }
        }
        summary
    }

    /// Removes completed/failed entries older than `max_age_ms`.
    pub fn cleanup(&self, max_age_ms: u64) -> usize {
        let now = now_ms();
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            let terminal = matches!(
                task.status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
            );
            if !terminal {
                return true;
            }
            let age = task
                .completed_at_ms
                .map(|completed| now.saturating_sub(completed))
                .unwrap_or(0);
            age <= max_age_ms
        });
        before - self.tasks.len()
    }

    /// Increments `retry_count` (monotonic) as part of the supervisor's
    /// retry algorithm.
    pub fn increment_retry(&self, id: TaskId) -> Result<u32, RegistryError> {
        let mut entry = self
            .tasks
            .get_mut(&id)
            .ok_or(RegistryError::TaskNotFound { task_id: id })?;
        entry.retry_count += 1;
        Ok(entry.retry_count)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_count_never_exceeds_max_retries_transition() {
        let registry = TaskRegistry::new(RegistryConfig::default());
        let id = registry.register(TaskDescriptor::new("reviewer", "do thing"));
        registry.update_status(id, TaskStatus::Running, None, None).unwrap();
        registry
            .update_status(id, TaskStatus::Failed, None, Some("boom".into()))
            .unwrap();
        registry.update_status(id, TaskStatus::Running, None, None).unwrap();
        let task = registry.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn unknown_id_heartbeat_is_a_noop_not_a_fault() {
        let registry = TaskRegistry::new(RegistryConfig::default());
        registry.heartbeat(TaskId::new());
    }

    #[test]
    fn load_from_ledger_marks_running_tasks_stale_and_skips_completed() {
        use crate::types::{Epic, LedgerTask};

        let registry = TaskRegistry::new(RegistryConfig::default());
        let mut ledger = Ledger::new("session-1", 0);
        let mut epic = Epic::new("epic-1", "title", "request", 0);
        epic.tasks.push(LedgerTask { id: "t1".into(), title: "reviewer".into(), status: TaskStatus::Running });
        epic.tasks.push(LedgerTask { id: "t2".into(), title: "writer".into(), status: TaskStatus::Completed });
        ledger.epic = Some(epic);

        registry.load_from_ledger(&ledger);

        assert_eq!(registry.len(), 1);
        let task = registry.by_status(TaskStatus::Stale).into_iter().next().unwrap();
        assert_eq!(task.ledger_task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn cleanup_only_removes_aged_terminal_tasks() {
        let registry = TaskRegistry::new(RegistryConfig::default());
        let id = registry.register(TaskDescriptor::new("reviewer", "do thing"));
        registry.update_status(id, TaskStatus::Running, None, None).unwrap();
        registry
            .update_status(id, TaskStatus::Completed, Some("ok".into()), None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let removed = registry.cleanup(0);
        assert_eq!(removed, 1);
        assert!(registry.get(id).is_none());
    }
}
