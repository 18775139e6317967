//! Supervisor (Observer): drives timeouts, stuck detection, retries and
//! terminal cleanup through a single adaptively-paced loop. Exactly one
//! instance runs per orchestrator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::CheckpointManager;
use crate::config::SupervisorConfig;
use crate::ledger::LedgerStore;
use crate::registry::TaskRegistry;
use crate::spawner::runtime_client::RuntimeSessionState;
use crate::spawner::{HandoffContext, SpawnMode, SpawnOutcome, SpawnRequest, Spawner};
use crate::types::{Complexity, CorrelationId, RegistryError, SessionId, Task, TaskStatus};

/// Supervisor/Observer loop: owns no state of its own beyond its tick count
/// and shutdown flag; all durable state lives in the registry, ledger and
/// stream it coordinates.
pub struct Supervisor {
    config: SupervisorConfig,
    registry: Arc<TaskRegistry>,
    spawner: Arc<Spawner>,
    ledger: Arc<LedgerStore>,
    checkpoints: Arc<CheckpointManager>,
    ticks: AtomicU64,
    stopping: AtomicBool,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<TaskRegistry>,
        spawner: Arc<Spawner>,
        ledger: Arc<LedgerStore>,
        checkpoints: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            config,
            registry,
            spawner,
            ledger,
            checkpoints,
            ticks: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Signals the run loop to stop after its current sleep; part of the
    /// orchestrator's shutdown protocol.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Runs until `stop()` is called. A single tick's failure never halts
    /// the loop; the next tick is scheduled unconditionally.
    pub async fn run(self: Arc<Self>) {
        tracing::info!("supervisor started");
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            let interval = self.adaptive_interval();
            tokio::time::sleep(interval).await;
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.tick().await;
        }
        tracing::info!("supervisor stopped");
    }

    /// low -> base_interval_ms, medium -> midpoint, high -> max_interval_ms;
    /// no running tasks also resolves to max_interval_ms.
    fn adaptive_interval(&self) -> Duration {
        let running = self.registry.by_status(TaskStatus::Running);
        let Some(highest) = running.iter().map(|t| t.complexity).max() else {
            return Duration::from_millis(self.config.max_interval_ms);
        };
        let ms = match highest {
            Complexity::Low => self.config.base_interval_ms,
            Complexity::Medium => (self.config.base_interval_ms + self.config.max_interval_ms) / 2,
            Complexity::High => self.config.max_interval_ms,
        };
        Duration::from_millis(ms)
    }

    async fn tick(&self) {
        let timed_out = self.registry.timed_out();
        let stuck = self.registry.stuck(self.config.stuck_threshold_ms);
        let running = self.registry.by_status(TaskStatus::Running);

        let mut retried = 0usize;
        let mut timed_out_count = 0usize;
        for task in &timed_out {
            match self.handle_timed_out(task).await {
                Ok(true) => retried += 1,
                Ok(false) => timed_out_count += 1,
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "failed to handle timed-out task"),
            }
        }

        let mut stuck_count = 0usize;
        for task in &stuck {
            if let Err(e) = self.handle_stuck(task).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to handle stuck task");
            } else {
                stuck_count += 1;
            }
        }

        for task in &running {
            if timed_out.iter().any(|t| t.id == task.id) || stuck.iter().any(|t| t.id == task.id) {
                continue;
            }
            if let Err(e) = self.poll_running(task).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to poll running task");
            }
        }

        let cleaned = self.registry.cleanup(3_600_000);

        tracing::debug!(
            timed_out = timed_out_count,
            retried,
            stuck = stuck_count,
            cleaned,
            "supervisor tick"
        );
    }

    /// Retry (fresh session, re-dispatch) if under budget, else mark
    /// `timeout`, emit `agent.failed`, record an anti-pattern learning and
    /// schedule session deletion.
    async fn handle_timed_out(&self, task: &Task) -> Result<bool, RegistryError> {
        if task.retry_count < task.max_retries {
            self.retry(task).await;
            Ok(true)
        } else {
            self.registry.update_status(
                task.id,
                TaskStatus::Timeout,
                None,
                Some("exceeded max_retries after timeout".to_string()),
            )?;
            self.ledger.push_activity(format!("task {} timed out after {} retries", task.id, task.retry_count));
            self.ledger.learning_extracted(
                "anti_pattern",
                format!("{} exceeded its timeout budget after {} retries", task.agent_name, task.retry_count),
            );
            if let Some(session_id) = &task.session_id {
                let _ = self.spawner.delete_session_if_not_busy(session_id).await;
            }
            Ok(false)
        }
    }

    /// If the runtime reports idle, treat as completed and fetch the last
    /// assistant message; otherwise mark `stale`, pause the active epic, and
    /// request a human checkpoint.
    async fn handle_stuck(&self, task: &Task) -> Result<(), RegistryError> {
        let Some(session_id) = &task.session_id else {
            return self.registry.update_status(task.id, TaskStatus::Stale, None, None);
        };

        match self.spawner.session_state(session_id).await {
            Some(RuntimeSessionState::Idle) | None => {
                let result = self.last_assistant_message(session_id).await;
                self.registry.update_status(task.id, TaskStatus::Completed, result, None)
            }
            Some(RuntimeSessionState::Busy) => {
                self.registry.update_status(task.id, TaskStatus::Stale, None, None)?;
                self.ledger.pause_for_intervention(&format!("task {} stopped reporting heartbeats", task.id));
                if let Some(ledger_task_id) = &task.ledger_task_id {
                    let _ = self
                        .checkpoints
                        .request(
                            session_id.clone(),
                            format!("task {ledger_task_id} appears stuck"),
                            Vec::new(),
                            "supervisor".to_string(),
                            CorrelationId::new(),
                            None,
                            "heartbeat_timeout",
                        )
                        .await;
                }
                Ok(())
            }
        }
    }

    /// If idle, fetch the result and update status; a running task whose
    /// session is still busy is left alone.
    async fn poll_running(&self, task: &Task) -> Result<(), RegistryError> {
        let Some(session_id) = &task.session_id else { return Ok(()) };
        if self.spawner.session_state(session_id).await != Some(RuntimeSessionState::Idle) {
            return Ok(());
        }
        let result = self.last_assistant_message(session_id).await;
        self.registry.update_status(task.id, TaskStatus::Completed, result, None)
    }

    async fn last_assistant_message(&self, session_id: &SessionId) -> Option<String> {
        self.spawner
            .runtime()
            .session_messages(session_id)
            .await
            .ok()
            .and_then(|messages| messages.into_iter().rev().find(|m| m.role == "assistant"))
            .map(|m| m.text)
    }

    async fn retry(&self, task: &Task) {
        let Ok(retry_count) = self.registry.increment_retry(task.id) else { return };

        let request = SpawnRequest {
            target_agent: task.agent_name.clone(),
            prompt: task.prompt.clone(),
            parent_session_id: task.parent_session_id.clone(),
            mode: SpawnMode::Async,
            timeout_ms: task.timeout_ms,
            requested_by: "supervisor".to_string(),
            correlation_id: CorrelationId::new(),
            handoff: None::<HandoffContext>,
        };

        match self.spawner.spawn(request, &[]).await {
            Ok(SpawnOutcome::HandoffIntent { session_id }) => {
                self.registry.update_session_id(task.id, session_id);
                tracing::info!(task_id = %task.id, retry_count, "retried timed-out task");
            }
            Ok(SpawnOutcome::Sync(result)) => {
                self.registry.update_session_id(task.id, result.session_id);
                tracing::info!(task_id = %task.id, retry_count, "retried timed-out task synchronously");
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "retry spawn failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskDescriptor;

    fn test_supervisor(config: SupervisorConfig, registry: Arc<TaskRegistry>) -> Supervisor {
        use crate::spawner::runtime_client::{RuntimeClient, RuntimeMessage};
        use async_trait::async_trait;
        use std::collections::HashMap;

        struct NullRuntime;
        #[async_trait]
        impl RuntimeClient for NullRuntime {
            async fn session_create(&self, _parent_id: Option<SessionId>, _title: &str) -> Result<SessionId, crate::types::SpawnError> {
                Ok(SessionId::new())
            }
            async fn session_prompt(&self, _id: &SessionId, _agent: &str, _parts: &[String]) -> Result<(), crate::types::SpawnError> {
                Ok(())
            }
            async fn session_prompt_async(&self, _id: &SessionId, _agent: &str, _parts: &[String]) -> Result<(), crate::types::SpawnError> {
                Ok(())
            }
            async fn session_status(&self) -> HashMap<SessionId, RuntimeSessionState> {
                HashMap::new()
            }
            async fn session_messages(&self, _id: &SessionId) -> Result<Vec<RuntimeMessage>, crate::types::SpawnError> {
                Ok(Vec::new())
            }
            async fn session_children(&self, _id: &SessionId) -> Result<Vec<SessionId>, crate::types::SpawnError> {
                Ok(Vec::new())
            }
            async fn session_delete(&self, _id: &SessionId) -> Result<(), crate::types::SpawnError> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let stream_config = crate::config::StreamConfig { stream_path: dir.path().join("stream.jsonl"), ..Default::default() };
        let stream = Arc::new(futures::executor::block_on(crate::stream::DurableEventStream::new(stream_config)).unwrap());
        let ledger_config = crate::config::LedgerConfig { ledger_path: dir.path().join("LEDGER.md"), ..Default::default() };
        let ledger = Arc::new(LedgerStore::load_or_new(ledger_config, "s").unwrap());
        let spawner = Arc::new(Spawner::new(crate::config::SpawnerConfig::default(), stream.clone(), ledger.clone(), Arc::new(NullRuntime)));
        let checkpoints = Arc::new(CheckpointManager::new(crate::config::CheckpointConfig::default(), stream));

        Supervisor::new(config, registry, spawner, ledger, checkpoints)
    }

    #[test]
    fn adaptive_interval_uses_max_when_no_tasks_are_running() {
        let registry = Arc::new(TaskRegistry::new(crate::config::RegistryConfig::default()));
        let config = SupervisorConfig::default();
        let max = config.max_interval_ms;
        let supervisor = test_supervisor(config, registry);
        assert_eq!(supervisor.adaptive_interval(), Duration::from_millis(max));
    }

    #[test]
    fn adaptive_interval_uses_base_for_low_complexity_running_tasks() {
        let registry = Arc::new(TaskRegistry::new(crate::config::RegistryConfig::default()));
        let mut descriptor = TaskDescriptor::new("reviewer", "do thing");
        descriptor.complexity = Some(Complexity::Low);
        let id = registry.register(descriptor);
        registry.update_status(id, TaskStatus::Running, None, None).unwrap();
        let config = SupervisorConfig::default();
        let base = config.base_interval_ms;
        let supervisor = test_supervisor(config, registry);
        assert_eq!(supervisor.adaptive_interval(), Duration::from_millis(base));
    }
}
