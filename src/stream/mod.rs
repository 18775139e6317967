//! Durable Event Stream: the system-of-record. Append-only log, pub/sub,
//! history ring, replay and rotation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::time::now_ms;
use crate::types::{CorrelationId, Event, EventInput, EventType, SessionId, StreamError};

/// Filter used by `subscribe`: either everything or a single event type.
#[derive(Debug, Clone)]
pub enum EventFilter {
    All,
    Type(EventType),
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Type(t) => &event.event_type == t,
        }
    }
}

/// Filter used by `query`, the recovery/lineage linear scan over the full log.
#[derive(Debug, Clone)]
pub enum EventQuery {
    All,
    ByType(EventType),
    ByStreamId(SessionId),
    ByCorrelationId(CorrelationId),
}

impl EventQuery {
    fn matches(&self, event: &Event) -> bool {
        match self {
            EventQuery::All => true,
            EventQuery::ByType(t) => &event.event_type == t,
            EventQuery::ByStreamId(id) => &event.stream_id == id,
            EventQuery::ByCorrelationId(id) => &event.correlation_id == id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct SubscriberEntry {
    id: SubscriptionId,
    filter: EventFilter,
    sender: mpsc::UnboundedSender<Event>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeStats {
    pub events_replayed: u64,
    pub last_offset: u64,
}

/// Append-only, durable event log with in-process pub/sub fan-out.
pub struct DurableEventStream {
    config: StreamConfig,
    next_offset: AtomicU64,
    history_ring: RwLock<VecDeque<Event>>,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    active_segment: AsyncMutex<SegmentWriter>,
}

struct SegmentWriter {
    path: PathBuf,
    file: File,
    bytes_written: u64,
}

impl DurableEventStream {
    pub async fn new(config: StreamConfig) -> Result<Self, StreamError> {
        if let Some(parent) = config.stream_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.stream_path)
            .await?;
        let bytes_written = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            next_offset: AtomicU64::new(0),
            history_ring: RwLock::new(VecDeque::new()),
            subscribers: RwLock::new(Vec::new()),
            active_segment: AsyncMutex::new(SegmentWriter {
                path: config.stream_path.clone(),
                file,
                bytes_written,
            }),
            config,
        })
    }

    /// Assigns a monotonically increasing offset, unique id and timestamp;
    /// persists before returning; notifies subscribers only after persistence
    /// succeeds. At-most-one side-effect per successful return.
    pub async fn append(&self, input: EventInput) -> Result<Event, StreamError> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let timestamp_ms = now_ms();
        let id = crate::types::EventId::new(&input.correlation_id, timestamp_ms, offset);

        let event = Event {
            offset,
            id,
            event_type: input.event_type,
            timestamp_ms,
            stream_id: input.stream_id,
            correlation_id: input.correlation_id,
            actor: input.actor,
            parent_event_id: input.parent_event_id,
            payload: input.payload,
            checkpoint: input.checkpoint,
        };

        self.persist(&event).await.map_err(|e| {
            StreamError::StreamUnavailable {
                reason: e.to_string(),
            }
        })?;

        {
            let mut ring = self.history_ring.write();
            if ring.len() >= self.config.history_ring_size {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        self.notify_subscribers(&event);

        Ok(event)
    }

    async fn persist(&self, event: &Event) -> Result<(), StreamError> {
        let line = serde_json::to_string(event).map_err(|e| StreamError::MalformedRecord {
            offset: event.offset,
            reason: e.to_string(),
        })?;

        let mut segment = self.active_segment.lock().await;
        segment.file.write_all(line.as_bytes()).await?;
        segment.file.write_all(b"\n").await?;
        segment.file.flush().await?;
        segment.bytes_written += line.len() as u64 + 1;

        let threshold = self.config.max_stream_size_mb * 1024 * 1024;
        if segment.bytes_written >= threshold {
            drop(segment);
            if let Err(e) = self.rotate().await {
                tracing::warn!(error = %e, "segment rotation failed, continuing on current segment");
            }
        }

        Ok(())
    }

    /// Invokes handlers sequentially per subscriber in offset order. A
    /// throwing handler is isolated and does not block delivery to other
    /// subscribers or block `append`.
    fn notify_subscribers(&self, event: &Event) {
        let subscribers = self.subscribers.read();
        for sub in subscribers.iter() {
            if sub.filter.matches(event) {
                if sub.sender.send(event.clone()).is_err() {
                    tracing::debug!(subscription = ?sub.id, "subscriber channel closed");
                }
            }
        }
    }

    /// Registers an in-process handler. The handler runs on its own task fed
    /// by a dedicated queue, so a slow or panicking subscriber cannot delay
    /// other subscribers or `append`.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let id = SubscriptionId(Uuid::new_v4());
        self.subscribers.write().push(SubscriberEntry {
            id,
            filter,
            sender: tx,
        });

        let handler = Arc::new(handler);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let handler = handler.clone();
                let offset = event.offset;
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event))).is_err() {
                    tracing::warn!(offset, "subscriber handler panicked, isolating");
                }
            }
        });

        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Returns a bounded window of recent events in ascending offset order.
    /// Callers must treat missing older events as non-authoritative and
    /// consult `query` for full replay.
    pub fn history(&self, limit: usize, filter: EventFilter) -> Vec<Event> {
        let ring = self.history_ring.read();
        ring.iter()
            .filter(|e| filter.matches(e))
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Linear scan over the persisted log, across rotated segments in order.
    pub async fn query(&self, filter: EventQuery) -> Result<Vec<Event>, StreamError> {
        let events = self.read_all_segments().await?;
        Ok(events.into_iter().filter(|e| filter.matches(e)).collect())
    }

    async fn rotated_segment_paths(&self) -> Result<Vec<PathBuf>, StreamError> {
        let dir = self
            .config
            .stream_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = self
            .config
            .stream_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("orchestration_stream")
            .to_string();

        let mut paths = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(StreamError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if name.starts_with(&format!("{stem}_")) && name.ends_with(".jsonl") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn read_all_segments(&self) -> Result<Vec<Event>, StreamError> {
        let mut events = Vec::new();
        for path in self.rotated_segment_paths().await? {
            events.extend(Self::read_segment_file(&path).await?);
        }
        events.extend(Self::read_segment_file(&self.config.stream_path).await?);
        events.sort_by_key(|e| e.offset);
        Ok(events)
    }

    /// A partially written trailing record is discarded; the next append
    /// overwrites it.
    async fn read_segment_file(path: &Path) -> Result<Vec<Event>, StreamError> {
        let file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StreamError::Io(e)),
        };
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding malformed trailing record");
                }
            }
        }
        Ok(events)
    }

    /// Seals the current segment under a `_<epoch_ms>.jsonl` suffix and
    /// starts a fresh one. Offsets continue monotonically across rotations.
    pub async fn rotate(&self) -> Result<(), StreamError> {
        let mut segment = self.active_segment.lock().await;
        let epoch = now_ms();
        let rotated_name = segment
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| format!("{stem}_{epoch}.jsonl"))
            .ok_or_else(|| StreamError::RotationFailed {
                reason: "stream path has no file stem".to_string(),
            })?;
        let rotated_path = segment
            .path
            .parent()
            .map(|p| p.join(&rotated_name))
            .unwrap_or_else(|| PathBuf::from(&rotated_name));

        segment.file.flush().await?;
        fs::rename(&segment.path, &rotated_path).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment.path)
            .await?;
        segment.file = file;
        segment.bytes_written = 0;

        tracing::info!(rotated = %rotated_path.display(), "rotated event stream segment");
        Ok(())
    }

    /// Reads all segments in order; populates the history ring and the
    /// offset counter; surfaces replay statistics.
    pub async fn resume(&self) -> Result<ResumeStats, StreamError> {
        let events = self.read_all_segments().await?;
        let last_offset = events.last().map(|e| e.offset).unwrap_or(0);
        let events_replayed = events.len() as u64;

        {
            let mut ring = self.history_ring.write();
            ring.clear();
            for event in events.iter().rev().take(self.config.history_ring_size).rev() {
                ring.push_back(event.clone());
            }
        }

        let next = if events.is_empty() { 0 } else { last_offset + 1 };
        self.next_offset.store(next, Ordering::SeqCst);

        tracing::info!(events_replayed, last_offset, "event stream resumed");
        Ok(ResumeStats {
            events_replayed,
            last_offset,
        })
    }

    pub fn last_offset(&self) -> u64 {
        self.next_offset.load(Ordering::SeqCst).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventPayload;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn input(correlation: CorrelationId) -> EventInput {
        EventInput::new(
            EventType::AgentSpawned,
            SessionId::new(),
            correlation,
            "test",
            EventPayload::Other(serde_json::json!({"k": "v"})),
        )
    }

    #[tokio::test]
    async fn offsets_are_strictly_increasing() {
        let dir = tempdir().unwrap();
        let mut config = StreamConfig::default();
        config.stream_path = dir.path().join("stream.jsonl");
        let stream = DurableEventStream::new(config).await.unwrap();

        let correlation = CorrelationId::new();
        let mut last = None;
        for _ in 0..20 {
            let event = stream.append(input(correlation)).await.unwrap();
            if let Some(prev) = last {
                assert!(event.offset > prev);
            }
            last = Some(event.offset);
        }
    }

    #[tokio::test]
    async fn resume_replays_exactly_the_persisted_events() {
        let dir = tempdir().unwrap();
        let mut config = StreamConfig::default();
        config.stream_path = dir.path().join("stream.jsonl");
        let correlation = CorrelationId::new();

        {
            let stream = DurableEventStream::new(config.clone()).await.unwrap();
            for _ in 0..5 {
                stream.append(input(correlation)).await.unwrap();
            }
        }

        let stream = DurableEventStream::new(config).await.unwrap();
        let stats = stream.resume().await.unwrap();
        assert_eq!(stats.events_replayed, 5);
        assert_eq!(stats.last_offset, 4);
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_offset_order_and_after_append_returns() {
        let dir = tempdir().unwrap();
        let mut config = StreamConfig::default();
        config.stream_path = dir.path().join("stream.jsonl");
        let stream = DurableEventStream::new(config).await.unwrap();

        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen_clone = seen.clone();
        stream.subscribe(EventFilter::All, move |event| {
            seen_clone.write().push(event.offset);
        });

        let correlation = CorrelationId::new();
        for _ in 0..10 {
            stream.append(input(correlation)).await.unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let offsets = seen.read().clone();
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
        assert_eq!(offsets.len(), 10);
    }

    #[tokio::test]
    async fn a_panicking_subscriber_does_not_block_others() {
        let dir = tempdir().unwrap();
        let mut config = StreamConfig::default();
        config.stream_path = dir.path().join("stream.jsonl");
        let stream = DurableEventStream::new(config).await.unwrap();

        stream.subscribe(EventFilter::All, |_event| {
            panic!("intentionally broken subscriber");
        });

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        stream.subscribe(EventFilter::All, move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        stream.append(input(CorrelationId::new())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotation_seals_current_segment_and_offsets_stay_monotonic() {
        let dir = tempdir().unwrap();
        let mut config = StreamConfig::default();
        config.stream_path = dir.path().join("stream.jsonl");
        let stream = DurableEventStream::new(config).await.unwrap();

        let correlation = CorrelationId::new();
        stream.append(input(correlation)).await.unwrap();
        stream.rotate().await.unwrap();
        let after = stream.append(input(correlation)).await.unwrap();
        assert_eq!(after.offset, 1);

        let all = stream.query(EventQuery::All).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
