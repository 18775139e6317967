//! Spawner / Coordinator: turns a logical delegation into a runtime session
//! and awaits its result deterministically.

pub mod dialogue;
pub mod runtime_client;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;

use crate::config::SpawnerConfig;
use crate::ledger::LedgerStore;
use crate::stream::{DurableEventStream, EventFilter};
use crate::time::now_ms;
use crate::types::{
    CorrelationId, Event, EventInput, EventPayload, EventType, SessionId, SpawnError,
};
use dialogue::{extract_dialogue_state, DialogueState};
use runtime_client::{RuntimeClient, RuntimeSessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    Async,
    Sync,
}

#[derive(Debug, Clone)]
pub struct HandoffContext {
    pub decisions: Vec<String>,
    pub plan: Vec<String>,
    pub affected_files: Vec<String>,
    pub relevant_learnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub target_agent: String,
    pub prompt: String,
    pub parent_session_id: Option<SessionId>,
    pub mode: SpawnMode,
    pub timeout_ms: u64,
    pub requested_by: String,
    pub correlation_id: CorrelationId,
    pub handoff: Option<HandoffContext>,
}

#[derive(Debug, Clone)]
pub struct SyncSpawnResult {
    pub success: bool,
    pub agent: String,
    pub session_id: SessionId,
    pub result: String,
    pub dialogue_state: Option<DialogueState>,
    pub timed_out: bool,
    pub continuation_hint: Option<SessionId>,
}

#[derive(Debug, Clone)]
pub enum SpawnOutcome {
    /// `async` mode: returned immediately with a handoff intent.
    HandoffIntent { session_id: SessionId },
    Sync(SyncSpawnResult),
}

enum WaitOutcome {
    Completed(String),
    Failed(String),
    Idle,
    TimedOut,
}

/// Stop-word filtered, word length > 2 keyword extraction for learning
/// retrieval context assembly. Deliberately stdlib-only tokenization: within
/// scope and too small to justify an NLP dependency.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "her", "was", "one", "our",
    "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old", "see", "two",
    "way", "who", "boy", "did", "its", "let", "put", "say", "she", "too", "use", "that", "with",
    "this", "from", "have", "will", "your", "what", "when", "make", "like", "into", "than",
    "then", "them", "these", "some", "just", "over", "also", "more", "only", "such",
];

fn extract_keywords(prompt: &str, max_keywords: usize) -> Vec<String> {
    let mut keywords = Vec::new();
    for raw in prompt.split(|c: char| !c.is_alphanumeric()) {
        if keywords.len() >= max_keywords {
            break;
        }
        let word = raw.to_lowercase();
        if word.len() <= 2 || STOP_WORDS.contains(&word.as_str()) {
            continue;
        }
        if !keywords.contains(&word) {
            keywords.push(word);
        }
    }
    keywords
}

pub struct Spawner {
    config: SpawnerConfig,
    stream: Arc<DurableEventStream>,
    ledger: Arc<LedgerStore>,
    runtime: Arc<dyn RuntimeClient>,
}

impl Spawner {
    pub fn new(
        config: SpawnerConfig,
        stream: Arc<DurableEventStream>,
        ledger: Arc<LedgerStore>,
        runtime: Arc<dyn RuntimeClient>,
    ) -> Self {
        Self {
            config,
            stream,
            ledger,
            runtime,
        }
    }

    /// (1) Internal agents may only be invoked by the designated coordinator
    /// agent; native runtime agents pass through. (2) The target must not
    /// already appear in `execution_stack`, and the stack must not exceed
    /// its depth limit.
    fn check_access_and_recursion(&self, target_agent: &str, requested_by: &str, execution_stack: &[String]) -> Result<(), SpawnError> {
        if self.config.native_agents.iter().any(|a| a == target_agent) {
            // native passthrough
        } else if self.config.internal_agents.iter().any(|a| a == target_agent)
            && requested_by != self.config.coordinator_agent
        {
            return Err(SpawnError::AccessDenied(format!(
                "{target_agent} is internal and may only be invoked by {}",
                self.config.coordinator_agent
            )));
        }

        if execution_stack.iter().any(|a| a == target_agent)
            || execution_stack.len() > crate::types::MAX_EXECUTION_STACK_DEPTH
        {
            return Err(SpawnError::RecursionDetected {
                agent: target_agent.to_string(),
            });
        }
        Ok(())
    }

    /// Prepends mandatory directives, up to K retrieved learnings, and
    /// explicit handoff context when the target agent requires it.
    fn assemble_context(&self, request: &SpawnRequest) -> String {
        let mut sections = Vec::new();

        if self.config.enable_context_preservation {
            let directives = self.ledger.mandatory_directives();
            if !directives.is_empty() {
                sections.push(format!("Directives:\n{}", directives.join("\n")));
            }

            let keywords = extract_keywords(&request.prompt, self.config.max_keywords);
            let learnings = self
                .ledger
                .learnings_matching(&keywords, self.config.max_learnings_in_context);
            if !learnings.is_empty() {
                sections.push(format!("Relevant learnings:\n{}", learnings.join("\n")));
            }
        }

        if self.config.context_required_agents.contains(&request.target_agent) {
            if let Some(handoff) = &request.handoff {
                let mut handoff_lines = Vec::new();
                if !handoff.decisions.is_empty() {
                    handoff_lines.push(format!("Decisions: {}", handoff.decisions.join("; ")));
                }
                if !handoff.plan.is_empty() {
                    handoff_lines.push(format!("Plan: {}", handoff.plan.join("; ")));
                }
                if !handoff.affected_files.is_empty() {
                    handoff_lines.push(format!("Affected files: {}", handoff.affected_files.join(", ")));
                }
                if !handoff.relevant_learnings.is_empty() {
                    handoff_lines.push(format!("Relevant learnings: {}", handoff.relevant_learnings.join("; ")));
                }
                sections.push(handoff_lines.join("\n"));
            }
        }

        sections.push(request.prompt.clone());
        sections.join("\n\n")
    }

    pub async fn spawn(
        &self,
        request: SpawnRequest,
        execution_stack: &[String],
    ) -> Result<SpawnOutcome, SpawnError> {
        self.check_access_and_recursion(&request.target_agent, &request.requested_by, execution_stack)?;

        let assembled_prompt = self.assemble_context(&request);

        let session_id = self
            .runtime
            .session_create(request.parent_session_id.clone(), &request.target_agent)
            .await
            .map_err(|e| SpawnError::SessionCreateFailed(e.to_string()))?;

        let prompt_prefix: String = assembled_prompt.chars().take(500).collect();
        self.stream
            .append(EventInput::new(
                EventType::AgentSpawned,
                session_id.clone(),
                request.correlation_id,
                request.requested_by.clone(),
                EventPayload::AgentSpawned {
                    agent: request.target_agent.clone(),
                    parent_session_id: request.parent_session_id.clone(),
                    prompt_prefix,
                    prompt_length: assembled_prompt.len(),
                },
            ))
            .await
            .map_err(|e| SpawnError::SpawnFailed(e.to_string()))?;

        match request.mode {
            SpawnMode::Async => {
                self.dispatch(&session_id, &request.target_agent, &assembled_prompt, true)
                    .await?;
                Ok(SpawnOutcome::HandoffIntent { session_id })
            }
            SpawnMode::Sync => {
                self.dispatch(&session_id, &request.target_agent, &assembled_prompt, false)
                    .await?;
                let result = self
                    .await_sync_completion(&request, session_id.clone())
                    .await?;
                Ok(SpawnOutcome::Sync(result))
            }
        }
    }

    async fn dispatch(&self, session_id: &SessionId, agent: &str, prompt: &str, is_async: bool) -> Result<(), SpawnError> {
        let parts = vec![prompt.to_string()];
        let result = if is_async {
            self.runtime.session_prompt_async(session_id, agent, &parts).await
        } else {
            self.runtime.session_prompt(session_id, agent, &parts).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(SpawnError::PromptFailed(msg)) if runtime_client::is_eof_quirk(&msg) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn await_sync_completion(
        &self,
        request: &SpawnRequest,
        session_id: SessionId,
    ) -> Result<SyncSpawnResult, SpawnError> {
        let outcome = self.wait_for_session_completion(&session_id, request.timeout_ms).await;

        let (text, failed) = match outcome {
            WaitOutcome::Completed(text) => (text, false),
            WaitOutcome::Failed(reason) => (reason, true),
            WaitOutcome::Idle => {
                let text = self.fetch_last_assistant_message(&session_id).await?;
                (text, false)
            }
            WaitOutcome::TimedOut => {
                self.stream
                    .append(EventInput::new(
                        EventType::AgentFailed,
                        session_id.clone(),
                        request.correlation_id,
                        "supervisor",
                        EventPayload::AgentFailed {
                            agent: request.target_agent.clone(),
                            session_id: session_id.clone(),
                            reason: "timed_out".to_string(),
                        },
                    ))
                    .await
                    .map_err(|e| SpawnError::SpawnFailed(e.to_string()))?;
                return Ok(SyncSpawnResult {
                    success: false,
                    agent: request.target_agent.clone(),
                    session_id,
                    result: String::new(),
                    dialogue_state: None,
                    timed_out: true,
                    continuation_hint: None,
                });
            }
        };

        let dialogue_state = extract_dialogue_state(&text);
        let blocking = dialogue_state.as_ref().map(|s| s.status.is_blocking()).unwrap_or(false);

        let event_type = if failed { EventType::AgentFailed } else { EventType::AgentCompleted };
        let payload = if failed {
            EventPayload::AgentFailed {
                agent: request.target_agent.clone(),
                session_id: session_id.clone(),
                reason: text.clone(),
            }
        } else {
            EventPayload::AgentCompleted {
                agent: request.target_agent.clone(),
                session_id: session_id.clone(),
                result: text.clone(),
            }
        };
        self.stream
            .append(EventInput::new(
                event_type,
                session_id.clone(),
                request.correlation_id,
                request.target_agent.clone(),
                payload,
            ))
            .await
            .map_err(|e| SpawnError::SpawnFailed(e.to_string()))?;

        Ok(SyncSpawnResult {
            success: !failed,
            agent: request.target_agent.clone(),
            session_id: session_id.clone(),
            result: text,
            continuation_hint: if blocking { Some(session_id) } else { None },
            dialogue_state,
            timed_out: false,
        })
    }

    async fn fetch_last_assistant_message(&self, session_id: &SessionId) -> Result<String, SpawnError> {
        let messages = self
            .runtime
            .session_messages(session_id)
            .await
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?;
        Ok(messages
            .into_iter()
            .rev()
            .find(|m| m.role == "assistant")
            .map(|m| m.text)
            .unwrap_or_default())
    }

    /// "Check history then subscribe" race-avoidance pattern: first consult
    /// the history ring for a terminal event already recorded; only then
    /// subscribe and race against the timeout. This eliminates the deadlock
    /// where a terminal event fires before a subscriber is attached.
    async fn wait_for_session_completion(&self, session_id: &SessionId, timeout_ms: u64) -> WaitOutcome {
        if let Some(event) = Self::find_terminal_event(&self.stream.history(1000, EventFilter::All), session_id) {
            return Self::wait_outcome_from_event(&event);
        }

        let (tx, rx) = tokio::sync::oneshot::channel::<Event>();
        let tx = Arc::new(SyncMutex::new(Some(tx)));
        let target = session_id.clone();
        let tx_for_handler = tx.clone();

        let subscription = self.stream.subscribe(EventFilter::All, move |event| {
            if event.stream_id == target
                && matches!(
                    event.event_type,
                    EventType::AgentCompleted | EventType::AgentFailed | EventType::SessionIdle
                )
            {
                if let Some(sender) = tx_for_handler.lock().take() {
                    let _ = sender.send(event);
                }
            }
        });

        let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(event)) => Self::wait_outcome_from_event(&event),
            _ => WaitOutcome::TimedOut,
        };
        self.stream.unsubscribe(subscription);
        outcome
    }

    fn find_terminal_event(history: &[Event], session_id: &SessionId) -> Option<Event> {
        history
            .iter()
            .rev()
            .find(|e| {
                &e.stream_id == session_id
                    && matches!(
                        e.event_type,
                        EventType::AgentCompleted | EventType::AgentFailed | EventType::SessionIdle
                    )
            })
            .cloned()
    }

    fn wait_outcome_from_event(event: &Event) -> WaitOutcome {
        match &event.payload {
            EventPayload::AgentCompleted { result, .. } => WaitOutcome::Completed(result.clone()),
            EventPayload::AgentFailed { reason, .. } => WaitOutcome::Failed(reason.clone()),
            _ if event.event_type == EventType::SessionIdle => WaitOutcome::Idle,
            _ => WaitOutcome::Idle,
        }
    }

    /// Used by the supervisor when polling for idle/busy status directly,
    /// bypassing the event-driven wait.
    pub async fn session_state(&self, session_id: &SessionId) -> Option<RuntimeSessionState> {
        self.runtime.session_status().await.get(session_id).copied()
    }

    pub async fn delete_session_if_not_busy(&self, session_id: &SessionId) -> Result<bool, SpawnError> {
        match self.session_state(session_id).await {
            Some(RuntimeSessionState::Busy) => Ok(false),
            _ => {
                self.runtime.session_delete(session_id).await?;
                Ok(true)
            }
        }
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_extraction_filters_stop_words_and_short_tokens() {
        let keywords = extract_keywords("Review the file and fix it up for us", 8);
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"it".to_string()));
        assert!(keywords.contains(&"review".to_string()));
        assert!(keywords.contains(&"file".to_string()));
    }

    #[test]
    fn keyword_extraction_caps_at_max() {
        let keywords = extract_keywords("alpha beta gamma delta epsilon zeta eta theta iota kappa", 3);
        assert_eq!(keywords.len(), 3);
    }
}
