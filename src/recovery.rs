//! Crash Recovery: reconstructs enough state from the durable event log to
//! continue cleanly after a restart.

use std::sync::Arc;

use crate::checkpoint::CheckpointManager;
use crate::ledger::LedgerStore;
use crate::registry::TaskRegistry;
use crate::stream::{DurableEventStream, EventQuery};
use crate::types::RecoveryError;

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub events_replayed: u64,
    pub last_offset: u64,
    pub tasks_hydrated: usize,
    pub pending_checkpoints: usize,
}

/// `resume()` on the stream, fold `ledger.*` events into the projection,
/// hydrate the registry from the resulting epic, then rehydrate the
/// checkpoint manager's pending set (emitting synthetic `timeout` rejections
/// for anything that expired during downtime). Order matters: the ledger
/// must exist before the registry can read its active epic.
pub async fn recover(
    stream: &Arc<DurableEventStream>,
    ledger: &Arc<LedgerStore>,
    registry: &TaskRegistry,
    checkpoints: &CheckpointManager,
) -> Result<RecoveryReport, RecoveryError> {
    let stats = stream.resume().await?;

    let events = stream.query(EventQuery::All).await?;
    ledger.rebuild_from_events(&events);
    if let Err(e) = ledger.flush() {
        tracing::warn!(error = %e, "failed to persist recovered ledger");
    }

    let snapshot = ledger.snapshot();
    registry.load_from_ledger(&snapshot);

    checkpoints.rehydrate(&events).await;

    let report = RecoveryReport {
        events_replayed: stats.events_replayed,
        last_offset: stats.last_offset,
        tasks_hydrated: registry.len(),
        pending_checkpoints: checkpoints.pending_count(),
    };
    tracing::info!(
        events_replayed = report.events_replayed,
        last_offset = report.last_offset,
        tasks_hydrated = report.tasks_hydrated,
        pending_checkpoints = report.pending_checkpoints,
        "recovery complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointConfig, LedgerConfig, RegistryConfig, StreamConfig};
    use crate::types::{CorrelationId, EventInput, EventPayload, EventType, SessionId};
    use tempfile::tempdir;

    #[tokio::test]
    async fn recovering_an_empty_log_yields_an_empty_report() {
        let dir = tempdir().unwrap();
        let mut stream_config = StreamConfig::default();
        stream_config.stream_path = dir.path().join("stream.jsonl");
        let stream = Arc::new(DurableEventStream::new(stream_config).await.unwrap());

        let mut ledger_config = LedgerConfig::default();
        ledger_config.ledger_path = dir.path().join("LEDGER.md");
        let ledger = Arc::new(LedgerStore::load_or_new(ledger_config, "session").unwrap());

        let registry = TaskRegistry::new(RegistryConfig::default());
        let checkpoints = CheckpointManager::new(CheckpointConfig::default(), stream.clone());

        let report = recover(&stream, &ledger, &registry, &checkpoints).await.unwrap();
        assert_eq!(report.events_replayed, 0);
        assert_eq!(report.tasks_hydrated, 0);
        assert_eq!(report.pending_checkpoints, 0);
    }

    #[tokio::test]
    async fn recovering_reconstructs_ledger_and_hydrates_registry() {
        let dir = tempdir().unwrap();
        let mut stream_config = StreamConfig::default();
        stream_config.stream_path = dir.path().join("stream.jsonl");
        let stream = Arc::new(DurableEventStream::new(stream_config).await.unwrap());

        let correlation_id = CorrelationId::new();
        stream
            .append(EventInput::new(
                EventType::LedgerEpicCreated,
                SessionId::new(),
                correlation_id,
                "coordinator",
                EventPayload::LedgerEpicCreated { id: "e1".into(), title: "ship it".into(), request: "do the thing".into() },
            ))
            .await
            .unwrap();
        stream
            .append(EventInput::new(
                EventType::LedgerTaskCreated,
                SessionId::new(),
                correlation_id,
                "coordinator",
                EventPayload::LedgerTaskCreated { id: "t1".into(), title: "reviewer".into() },
            ))
            .await
            .unwrap();
        stream
            .append(EventInput::new(
                EventType::LedgerTaskStarted,
                SessionId::new(),
                correlation_id,
                "coordinator",
                EventPayload::LedgerTaskStarted { id: "t1".into() },
            ))
            .await
            .unwrap();

        drop(stream);
        let mut stream_config = StreamConfig::default();
        stream_config.stream_path = dir.path().join("stream.jsonl");
        let stream = Arc::new(DurableEventStream::new(stream_config).await.unwrap());

        let mut ledger_config = LedgerConfig::default();
        ledger_config.ledger_path = dir.path().join("LEDGER.md");
        let ledger = Arc::new(LedgerStore::load_or_new(ledger_config, "session").unwrap());

        let registry = TaskRegistry::new(RegistryConfig::default());
        let checkpoints = CheckpointManager::new(CheckpointConfig::default(), stream.clone());

        let report = recover(&stream, &ledger, &registry, &checkpoints).await.unwrap();
        assert_eq!(report.events_replayed, 3);
        assert_eq!(report.tasks_hydrated, 1);

        let task = registry.by_status(crate::types::TaskStatus::Stale).into_iter().next().unwrap();
        assert_eq!(task.ledger_task_id.as_deref(), Some("t1"));
    }
}
