//! Checkpoint / HITL: request human decisions, await a result within a
//! deadline, and route approvals/rejections back to the requester exactly
//! once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::oneshot;

use crate::config::CheckpointConfig;
use crate::stream::DurableEventStream;
use crate::time::now_ms;
use crate::types::{
    Checkpoint, CheckpointError, CheckpointId, CheckpointOption, CheckpointStatus, CorrelationId,
    Event, EventInput, EventPayload, EventType, SessionId,
};

/// The awaitable outcome of a checkpoint's resolution.
#[derive(Clone)]
pub enum CheckpointResolution {
    Approved { selected_option: String },
    Rejected { reason: String },
}

impl std::fmt::Debug for CheckpointResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointResolution::Approved { selected_option } => write!(f, "Approved({selected_option})"),
            CheckpointResolution::Rejected { reason } => write!(f, "Rejected({reason})"),
        }
    }
}

struct PendingCheckpoint {
    checkpoint: Checkpoint,
    /// Taken by whichever of approve/reject/timeout resolves first; a
    /// subsequent caller observes `None` and returns `false`.
    waiter: SyncMutex<Option<oneshot::Sender<CheckpointResolution>>>,
}

/// Holds pending checkpoints and resolves them exactly once.
pub struct CheckpointManager {
    config: CheckpointConfig,
    stream: Arc<DurableEventStream>,
    pending: DashMap<CheckpointId, Arc<PendingCheckpoint>>,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig, stream: Arc<DurableEventStream>) -> Self {
        Self {
            config,
            stream,
            pending: DashMap::new(),
        }
    }

    /// Requests a decision and arms a timer to its `expires_at`. Returns the
    /// new checkpoint's id immediately; callers that need to block on the
    /// result should use [`await_resolution`](Self::await_resolution).
    pub async fn request(
        &self,
        stream_id: SessionId,
        decision_point: String,
        options: Vec<CheckpointOption>,
        requested_by: String,
        correlation_id: CorrelationId,
        timeout_ms: Option<u64>,
        reason: &str,
    ) -> Result<CheckpointId, CheckpointError> {
        let id = CheckpointId::new();
        let now = now_ms();
        let timeout_ms = timeout_ms.unwrap_or(self.config.checkpoint_timeout_ms);
        let checkpoint = Checkpoint {
            id,
            stream_id: stream_id.clone(),
            decision_point: decision_point.clone(),
            options,
            requested_by: requested_by.clone(),
            requested_at_ms: now,
            expires_at_ms: now + timeout_ms,
            approved_by: None,
            approved_at_ms: None,
            selected_option: None,
            rejected_reason: None,
            status: CheckpointStatus::Pending,
        };

        self.stream
            .append(EventInput::new(
                EventType::CheckpointRequested,
                stream_id,
                correlation_id,
                requested_by,
                EventPayload::CheckpointRequested {
                    checkpoint_id: id,
                    decision_point,
                    reason: reason.to_string(),
                },
            ))
            .await?;

        self.pending.insert(
            id,
            Arc::new(PendingCheckpoint {
                checkpoint,
                waiter: SyncMutex::new(None),
            }),
        );

        self.arm_timeout(id, timeout_ms);
        Ok(id)
    }

    fn arm_timeout(&self, id: CheckpointId, timeout_ms: u64) {
        let pending = self.pending.clone();
        let stream = self.stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            if let Some((_, entry)) = pending.remove(&id) {
                if let Some(sender) = entry.waiter.lock().take() {
                    let _ = sender.send(CheckpointResolution::Rejected { reason: "timeout".to_string() });
                }
                let correlation_id = CorrelationId::new();
                let stream_id = entry.checkpoint.stream_id.clone();
                let _ = stream
                    .append(EventInput::new(
                        EventType::CheckpointRejected,
                        stream_id,
                        correlation_id,
                        "supervisor",
                        EventPayload::CheckpointRejected { checkpoint_id: id, reason: "timeout".to_string() },
                    ))
                    .await;
            }
        });
    }

    /// Registers a waiter for `id`'s resolution. Returns `None` if the
    /// checkpoint is unknown (already resolved or never requested).
    pub fn await_resolution(&self, id: CheckpointId) -> Option<oneshot::Receiver<CheckpointResolution>> {
        let entry = self.pending.get(&id)?;
        let (tx, rx) = oneshot::channel();
        *entry.waiter.lock() = Some(tx);
        Some(rx)
    }

    /// Resolves `id` as approved. Returns `false` if already resolved.
    pub async fn approve(
        &self,
        id: CheckpointId,
        selected_option: String,
        correlation_id: CorrelationId,
    ) -> Result<bool, CheckpointError> {
        let Some((_, entry)) = self.pending.remove(&id) else {
            return Ok(false);
        };
        if let Some(sender) = entry.waiter.lock().take() {
            let _ = sender.send(CheckpointResolution::Approved { selected_option: selected_option.clone() });
        }
        self.stream
            .append(EventInput::new(
                EventType::CheckpointApproved,
                entry.checkpoint.stream_id.clone(),
                correlation_id,
                entry.checkpoint.requested_by.clone(),
                EventPayload::CheckpointApproved { checkpoint_id: id, selected_option },
            ))
            .await?;
        Ok(true)
    }

    /// Resolves `id` as rejected. Returns `false` if already resolved.
    pub async fn reject(&self, id: CheckpointId, reason: String, correlation_id: CorrelationId) -> Result<bool, CheckpointError> {
        let Some((_, entry)) = self.pending.remove(&id) else {
            return Ok(false);
        };
        if let Some(sender) = entry.waiter.lock().take() {
            let _ = sender.send(CheckpointResolution::Rejected { reason: reason.clone() });
        }
        self.stream
            .append(EventInput::new(
                EventType::CheckpointRejected,
                entry.checkpoint.stream_id.clone(),
                correlation_id,
                entry.checkpoint.requested_by.clone(),
                EventPayload::CheckpointRejected { checkpoint_id: id, reason },
            ))
            .await?;
        Ok(true)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<CheckpointId> {
        self.pending.iter().map(|e| *e.key()).collect()
    }

    /// Rehydrates the pending set from a full event replay: a
    /// `checkpoint.requested` with no subsequent `approved`/`rejected`
    /// remains pending; expired-during-downtime checkpoints are immediately
    /// resolved with a synthetic `timeout` rejection and a matching
    /// `checkpoint.rejected` event is appended.
    pub async fn rehydrate(&self, events: &[Event]) {
        let mut pending: std::collections::HashMap<CheckpointId, Checkpoint> = std::collections::HashMap::new();
        for event in events {
            match (&event.event_type, &event.payload) {
                (EventType::CheckpointRequested, _) => {
                    if let Some(checkpoint) = &event.checkpoint {
                        pending.insert(checkpoint.id, checkpoint.clone());
                    }
                }
                (EventType::CheckpointApproved, EventPayload::CheckpointApproved { checkpoint_id, .. })
                | (EventType::CheckpointRejected, EventPayload::CheckpointRejected { checkpoint_id, .. }) => {
                    pending.remove(checkpoint_id);
                }
                _ => {}
            }
        }

        let now = now_ms();
        for (id, checkpoint) in pending {
            if checkpoint.expires_at_ms <= now {
                let _ = self
                    .stream
                    .append(EventInput::new(
                        EventType::CheckpointRejected,
                        checkpoint.stream_id.clone(),
                        CorrelationId::new(),
                        "recovery",
                        EventPayload::CheckpointRejected { checkpoint_id: id, reason: "timeout".to_string() },
                    ))
                    .await;
            } else {
                let remaining = checkpoint.expires_at_ms.saturating_sub(now);
                self.pending.insert(
                    id,
                    Arc::new(PendingCheckpoint { checkpoint, waiter: SyncMutex::new(None) }),
                );
                self.arm_timeout(id, remaining);
            }
        }
    }

    /// Rejects every still-pending checkpoint with `reason = "shutdown"`,
    /// part of the orchestrator's shutdown protocol.
    pub async fn reject_all_for_shutdown(&self) {
        let ids: Vec<CheckpointId> = self.pending_ids();
        for id in ids {
            let _ = self.reject(id, "shutdown".to_string(), CorrelationId::new()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use tempfile::tempdir;

    async fn manager() -> CheckpointManager {
        let dir = tempdir().unwrap();
        let mut stream_config = StreamConfig::default();
        stream_config.stream_path = dir.path().join("stream.jsonl");
        let stream = Arc::new(DurableEventStream::new(stream_config).await.unwrap());
        CheckpointManager::new(CheckpointConfig::default(), stream)
    }

    #[tokio::test]
    async fn approve_resolves_a_waiter_exactly_once() {
        let manager = manager().await;
        let id = manager
            .request(SessionId::new(), "pick a plan".into(), vec![], "coordinator".into(), CorrelationId::new(), Some(60_000), "human_in_loop")
            .await
            .unwrap();

        let rx = manager.await_resolution(id).unwrap();
        assert!(manager.approve(id, "plan_a".into(), CorrelationId::new()).await.unwrap());
        assert!(!manager.approve(id, "plan_a".into(), CorrelationId::new()).await.unwrap());

        match rx.await.unwrap() {
            CheckpointResolution::Approved { selected_option } => assert_eq!(selected_option, "plan_a"),
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rehydrate_skips_checkpoints_already_resolved() {
        let manager = manager().await;
        let id = manager
            .request(SessionId::new(), "pick a plan".into(), vec![], "coordinator".into(), CorrelationId::new(), Some(60_000), "human_in_loop")
            .await
            .unwrap();
        manager.reject(id, "no longer needed".into(), CorrelationId::new()).await.unwrap();

        let events = manager.stream.query(crate::stream::EventQuery::All).await.unwrap();
        let fresh = manager().await;
        fresh.rehydrate(&events).await;
        assert_eq!(fresh.pending_count(), 0);
    }
}
