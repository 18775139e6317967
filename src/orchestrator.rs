//! Orchestrator: wires the event stream, registry, ledger, actor processor,
//! spawner, checkpoint manager, learning extractor and supervisor into a
//! single running system.

use std::path::PathBuf;
use std::sync::Arc;

use crate::actor::{ActorProcessor, Message};
use crate::checkpoint::CheckpointManager;
use crate::config::OrchestratorConfig;
use crate::ledger::LedgerStore;
use crate::learning::LearningExtractor;
use crate::recovery::{self, RecoveryReport};
use crate::registry::TaskRegistry;
use crate::spawner::runtime_client::RuntimeClient;
use crate::spawner::Spawner;
use crate::stream::DurableEventStream;
use crate::supervisor::Supervisor;
use crate::time::now_ms;
use crate::types::{ActorState, CorrelationId, OrchestratorError, OrchestratorStatus, Phase, SessionId, TaskStatus};

/// Top-level orchestrator. One instance per running coordinator session.
pub struct Orchestrator {
    pub stream: Arc<DurableEventStream>,
    pub registry: Arc<TaskRegistry>,
    pub ledger: Arc<LedgerStore>,
    pub spawner: Arc<Spawner>,
    pub actor: Arc<ActorProcessor>,
    pub checkpoints: Arc<CheckpointManager>,
    pub learning: Arc<LearningExtractor>,
    pub supervisor: Arc<Supervisor>,
    supervisor_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds every component but does not start the supervisor loop or
    /// subscribe the learning extractor -- call [`init`](Self::init) for that.
    pub async fn new(
        config: OrchestratorConfig,
        session_id: impl Into<String>,
        runtime: Arc<dyn RuntimeClient>,
    ) -> Result<Self, OrchestratorError> {
        config.validate().map_err(OrchestratorError::Config)?;

        let session_id = session_id.into();
        let stream = Arc::new(DurableEventStream::new(config.stream.clone()).await?);
        let registry = Arc::new(TaskRegistry::new(config.registry.clone()));
        let ledger = Arc::new(LedgerStore::load_or_new(config.ledger.clone(), session_id.clone())?);
        let spawner = Arc::new(Spawner::new(config.spawner.clone(), stream.clone(), ledger.clone(), runtime));
        let checkpoints = Arc::new(CheckpointManager::new(config.checkpoint.clone(), stream.clone()));
        let learning = Arc::new(LearningExtractor::new(config.learning.clone(), ledger.clone()));

        let actor_state = ActorState::new(SessionId(session_id), now_ms());
        let actor = Arc::new(ActorProcessor::new(actor_state, stream.clone(), ledger.clone(), config.actor_state_path.clone()));

        let supervisor = Arc::new(Supervisor::new(
            config.supervisor.clone(),
            registry.clone(),
            spawner.clone(),
            ledger.clone(),
            checkpoints.clone(),
        ));

        Ok(Self {
            stream,
            registry,
            ledger,
            spawner,
            actor,
            checkpoints,
            learning,
            supervisor,
            supervisor_handle: std::sync::Mutex::new(None),
        })
    }

    /// Runs crash recovery, subscribes the learning extractor in real-time
    /// mode, and starts the supervisor's background loop.
    pub async fn init(&self) -> Result<RecoveryReport, OrchestratorError> {
        let report = recovery::recover(&self.stream, &self.ledger, &self.registry, &self.checkpoints).await?;

        self.learning.clone().subscribe(&self.stream);

        let supervisor = self.supervisor.clone();
        let handle = tokio::spawn(async move { supervisor.run().await });
        *self.supervisor_handle.lock().unwrap() = Some(handle);

        tracing::info!(events_replayed = report.events_replayed, "orchestrator initialized");
        Ok(report)
    }

    pub fn status(&self) -> OrchestratorStatus {
        let summary = self.registry.summary();
        OrchestratorStatus {
            last_offset: self.stream.last_offset(),
            tasks_pending: summary.pending,
            tasks_running: summary.running,
            tasks_completed: summary.completed,
            tasks_failed: summary.failed,
            pending_checkpoints: self.checkpoints.pending_count(),
            supervisor_ticks: self.supervisor.tick_count(),
        }
    }

    /// Implements the shutdown protocol exactly: stop the supervisor, reset
    /// the registry, reject pending checkpoints with `shutdown`, flush the
    /// learning extractor's pending writes (via the ledger's debounce), flush
    /// the projector, then let the stream's segment writer close naturally
    /// when this struct is dropped.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        tracing::info!("orchestrator shutting down");
        self.supervisor.stop();
        if let Some(handle) = self.supervisor_handle.lock().unwrap().take() {
            let _ = handle.await;
        }

        for task in self.registry.by_status(TaskStatus::Pending) {
            let _ = self.registry.update_status(task.id, TaskStatus::Suspended, None, Some("shutdown".to_string()));
        }
        for task in self.registry.by_status(TaskStatus::Running) {
            let _ = self.registry.update_status(task.id, TaskStatus::Suspended, None, Some("shutdown".to_string()));
        }

        self.checkpoints.reject_all_for_shutdown().await;
        self.ledger.flush()?;

        tracing::info!("orchestrator stopped");
        Ok(())
    }

    pub fn actor_state_path(&self) -> PathBuf {
        self.actor.state_path().to_path_buf()
    }

    /// Recursive abort: aborts every descendant session in
    /// reverse spawn order (children first, so a deeper sub-agent is torn
    /// down before the ancestor that spawned it), transitions the actor to
    /// `FAILED`, and marks every task bound to an aborted session terminal
    /// and cleanup-eligible. Unlike the supervisor's routine session
    /// cleanup, abort does not wait for a busy session to go idle -- it is
    /// an explicit cancellation, not best-effort housekeeping.
    pub async fn abort(&self, reason: &str) -> Result<(), OrchestratorError> {
        let state = self.actor.snapshot();
        let mut descendants: Vec<_> = state.sub_agents.iter().collect();
        descendants.sort_by_key(|(_, entry)| std::cmp::Reverse(entry.spawned_at_ms));

        for (session_id, _) in descendants {
            let session = SessionId(session_id.clone());
            if let Err(e) = self.spawner.runtime().session_delete(&session).await {
                tracing::warn!(session_id = %session_id, error = %e, "failed to abort descendant session");
            }
            for task in self.registry.by_session_id(&session) {
                self.registry.force_terminal(task.id, TaskStatus::Failed, Some(reason.to_string()));
            }
        }

        self.actor
            .dispatch(Message::PhaseChange { phase: Phase::Failed }, CorrelationId::new(), "abort")
            .await?;
        self.ledger.push_activity(format!("actor aborted: {reason}"));

        tracing::warn!(reason, "actor aborted; descendants cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::runtime_client::{RuntimeMessage, RuntimeSessionState};
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

    #[tokio::test]
    async fn init_on_an_empty_log_recovers_cleanly_and_status_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.stream.stream_path = dir.path().join("stream.jsonl");
        config.ledger.ledger_path = dir.path().join("LEDGER.md");
        config.actor_state_path = dir.path().join("actor-state.json");
        config.supervisor.base_interval_ms = 60_000;
        config.supervisor.max_interval_ms = 60_000;

        let orchestrator = Orchestrator::new(config, "session-1", Arc::new(NullRuntime)).await.unwrap();
        let report = orchestrator.init().await.unwrap();
        assert_eq!(report.events_replayed, 0);

        let status = orchestrator.status();
        assert_eq!(status.tasks_running, 0);
        assert_eq!(status.pending_checkpoints, 0);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn abort_transitions_actor_to_failed_and_marks_descendant_tasks_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.stream.stream_path = dir.path().join("stream.jsonl");
        config.ledger.ledger_path = dir.path().join("LEDGER.md");
        config.actor_state_path = dir.path().join("actor-state.json");
        config.supervisor.base_interval_ms = 60_000;
        config.supervisor.max_interval_ms = 60_000;

        let orchestrator = Orchestrator::new(config, "session-1", Arc::new(NullRuntime)).await.unwrap();
        orchestrator.init().await.unwrap();

        let child = SessionId::new();
        orchestrator
            .actor
            .dispatch(
                Message::SubagentSpawn { session_id: child.0.clone(), agent: "reviewer".to_string() },
                CorrelationId::new(),
                "coordinator",
            )
            .await
            .unwrap();

        let task_id = orchestrator.registry.register(crate::types::TaskDescriptor::new("reviewer", "do thing"));
        orchestrator.registry.update_session_id(task_id, child.clone());
        orchestrator.registry.update_status(task_id, TaskStatus::Running, None, None).unwrap();

        orchestrator.abort("test cancellation").await.unwrap();

        assert_eq!(orchestrator.actor.snapshot().phase, Phase::Failed);
        let task = orchestrator.registry.get(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }
}
