//! Learning Extractor: classifies completed work into durable learnings,
//! fed either in real time (subscribed to the event stream) or on demand
//! over a session's recorded history.

use std::sync::Arc;

use crate::config::LearningConfig;
use crate::ledger::LedgerStore;
use crate::stream::{DurableEventStream, EventFilter};
use crate::types::{Event, EventPayload, EventType, LearningError};

/// One candidate learning pulled out of an event, before the confidence/cap
/// gate is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: &'static str,
    pub content: String,
    pub confidence: f32,
}

const CORRECTION_CUES: &[&str] = &["instead", "don't use", "should be", "should not", "never use"];
const FAILURE_PHRASES: &[&str] = &["timeout", "timed out", "crash", "crashed", "disconnect", "disconnected"];

/// Pure classification over a single event. Returns `None` when the event
/// carries no learnable signal.
pub fn classify(event: &Event) -> Option<Candidate> {
    match (&event.event_type, &event.payload) {
        (EventType::AgentCompleted, EventPayload::AgentCompleted { result, .. }) => {
            let lower = result.to_lowercase();
            if CORRECTION_CUES.iter().any(|cue| lower.contains(cue)) {
                return Some(Candidate { kind: "pattern", content: result.clone(), confidence: 0.7 });
            }
            Some(Candidate { kind: "decision", content: result.clone(), confidence: 0.65 })
        }
        (EventType::SessionError, EventPayload::Other(value)) => {
            let text = value.get("message").and_then(|v| v.as_str()).unwrap_or_default();
            if CORRECTION_CUES.iter().any(|cue| text.to_lowercase().contains(cue)) {
                Some(Candidate { kind: "pattern", content: text.to_string(), confidence: 0.6 })
            } else {
                None
            }
        }
        (EventType::AgentFailed, EventPayload::AgentFailed { reason, .. }) => {
            let lower = reason.to_lowercase();
            if FAILURE_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
                Some(Candidate { kind: "anti_pattern", content: reason.clone(), confidence: 0.75 })
            } else {
                None
            }
        }
        (EventType::CheckpointApproved, EventPayload::CheckpointApproved { selected_option, .. }) => {
            Some(Candidate {
                kind: "preference",
                content: format!("chose {selected_option} at decision point"),
                confidence: 0.8,
            })
        }
        _ => None,
    }
}

/// Wires classification to the ledger's `learning.extracted` projection,
/// gated on `min_confidence` and capped at `max_learnings` per run.
pub struct LearningExtractor {
    config: LearningConfig,
    ledger: Arc<LedgerStore>,
}

impl LearningExtractor {
    pub fn new(config: LearningConfig, ledger: Arc<LedgerStore>) -> Self {
        Self { config, ledger }
    }

    fn accept(&self, candidate: &Candidate, extracted_so_far: usize) -> bool {
        candidate.confidence >= self.config.min_confidence && extracted_so_far < self.config.max_learnings
    }

    /// Real-time mode: one subscription for the process lifetime, an
    /// internal counter bounds how many learnings a single run will emit.
    pub fn subscribe(self: Arc<Self>, stream: &DurableEventStream) {
        let extracted = std::sync::atomic::AtomicUsize::new(0);
        let this = self.clone();
        stream.subscribe(EventFilter::All, move |event| {
            let Some(candidate) = classify(&event) else { return };
            let count = extracted.load(std::sync::atomic::Ordering::SeqCst);
            if !this.accept(&candidate, count) {
                return;
            }
            extracted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            this.ledger.learning_extracted(candidate.kind, candidate.content);
        });
    }

    /// Batch/on-demand mode: classifies a session's full event history and
    /// emits `ledger.learning.extracted` events for everything accepted.
    pub async fn extract_from_history(
        &self,
        stream: &DurableEventStream,
        events: &[Event],
        correlation_id: crate::types::CorrelationId,
    ) -> Result<Vec<Candidate>, LearningError> {
        let mut accepted = Vec::new();
        for event in events {
            let Some(candidate) = classify(event) else { continue };
            if !self.accept(&candidate, accepted.len()) {
                continue;
            }
            stream
                .append(crate::types::EventInput::new(
                    EventType::LedgerLearningExtracted,
                    event.stream_id.clone(),
                    correlation_id.clone(),
                    "learning-extractor",
                    EventPayload::LearningExtracted { kind: candidate.kind.to_string(), content: candidate.content.clone() },
                ))
                .await?;
            accepted.push(candidate);
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CorrelationId, EventId, SessionId};

    fn mk(event_type: EventType, payload: EventPayload) -> Event {
        Event {
            offset: 0,
            id: EventId::new(&CorrelationId::new(), 0, 0),
            event_type,
            timestamp_ms: 0,
            stream_id: SessionId::new(),
            correlation_id: CorrelationId::new(),
            actor: "test".into(),
            parent_event_id: None,
            payload,
            checkpoint: None,
        }
    }

    #[test]
    fn agent_failed_with_no_recognizable_phrase_yields_no_candidate() {
        let event = mk(
            EventType::AgentFailed,
            EventPayload::AgentFailed { agent: "reviewer".into(), session_id: SessionId::new(), reason: "unexpected value".into() },
        );
        assert!(classify(&event).is_none());
    }

    #[test]
    fn agent_failed_with_timeout_phrase_is_an_anti_pattern() {
        let event = mk(
            EventType::AgentFailed,
            EventPayload::AgentFailed { agent: "reviewer".into(), session_id: SessionId::new(), reason: "connection timed out".into() },
        );
        let candidate = classify(&event).unwrap();
        assert_eq!(candidate.kind, "anti_pattern");
    }

    #[test]
    fn correction_cue_in_a_completed_result_is_classified_as_a_storable_pattern() {
        let event = mk(
            EventType::AgentCompleted,
            EventPayload::AgentCompleted {
                agent: "reviewer".into(),
                session_id: SessionId::new(),
                result: "should be using the retry helper instead of a raw loop".into(),
            },
        );
        let candidate = classify(&event).unwrap();
        assert_eq!(candidate.kind, "pattern");

        let mut learnings = crate::types::Learnings::default();
        learnings.push(candidate.kind, candidate.content.clone());
        assert_eq!(learnings.patterns, vec![candidate.content]);
    }

    #[test]
    fn checkpoint_approval_is_a_preference() {
        let event = mk(
            EventType::CheckpointApproved,
            EventPayload::CheckpointApproved { checkpoint_id: crate::types::CheckpointId::new(), selected_option: "plan_a".into() },
        );
        let candidate = classify(&event).unwrap();
        assert_eq!(candidate.kind, "preference");
        assert!(candidate.content.contains("plan_a"));
    }

    #[test]
    fn low_confidence_candidate_is_rejected_by_the_gate() {
        let mut config = LearningConfig::default();
        config.min_confidence = 0.9;
        let dir = tempfile::tempdir().unwrap();
        let mut ledger_config = crate::config::LedgerConfig::default();
        ledger_config.ledger_path = dir.path().join("LEDGER.md");
        let ledger = Arc::new(crate::ledger::LedgerStore::load_or_new(ledger_config, "s").unwrap());
        let extractor = LearningExtractor::new(config, ledger);
        let candidate = Candidate { kind: "decision", content: "x".into(), confidence: 0.65 };
        assert!(!extractor.accept(&candidate, 0));
    }
}
