//! The external Runtime: model providers, conversational execution and
//! session lifecycle live behind this trait. The orchestrator core never
//! implements it beyond a test fake and the thin HTTP client below.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::types::{SessionId, SpawnError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSessionState {
    Idle,
    Busy,
}

#[derive(Debug, Clone)]
pub struct RuntimeMessage {
    pub role: String,
    pub text: String,
}

/// The external Runtime's session lifecycle and messaging API surface.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn session_create(&self, parent_id: Option<SessionId>, title: &str) -> Result<SessionId, SpawnError>;

    /// The Runtime's "Unexpected EOF" quirk on `session.prompt` must be
    /// normalized to success by the implementation.
    async fn session_prompt(&self, id: &SessionId, agent: &str, parts: &[String]) -> Result<(), SpawnError>;

    async fn session_prompt_async(&self, id: &SessionId, agent: &str, parts: &[String]) -> Result<(), SpawnError>;

    async fn session_status(&self) -> HashMap<SessionId, RuntimeSessionState>;

    async fn session_messages(&self, id: &SessionId) -> Result<Vec<RuntimeMessage>, SpawnError>;

    async fn session_children(&self, id: &SessionId) -> Result<Vec<SessionId>, SpawnError>;

    async fn session_delete(&self, id: &SessionId) -> Result<(), SpawnError>;
}

/// Normalizes the Runtime's "Unexpected EOF" quirk to success: the Runtime
/// raises it even when the prompt was accepted, so callers should not treat
/// it as a real failure.
pub fn is_eof_quirk(message: &str) -> bool {
    message.contains("Unexpected EOF")
}

#[derive(Debug, Deserialize)]
struct SessionCreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StatusEntry {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct MessageEntry {
    role: String,
    text: String,
}

/// Talks to the external Runtime's HTTP surface over
/// `reqwest`, the orchestrator's only production `RuntimeClient`
/// implementation. Every error is mapped to the matching `SpawnError` tag so
/// callers can match on it regardless of transport.
pub struct HttpRuntimeClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRuntimeClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SpawnError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SpawnError::SessionCreateFailed(format!("http client init: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl RuntimeClient for HttpRuntimeClient {
    async fn session_create(&self, parent_id: Option<SessionId>, title: &str) -> Result<SessionId, SpawnError> {
        let body = serde_json::json!({ "parent_id": parent_id.map(|p| p.0), "title": title });
        let response = self
            .client
            .post(self.url("/session"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SpawnError::SessionCreateFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| SpawnError::SessionCreateFailed(e.to_string()))?
            .json::<SessionCreateResponse>()
            .await
            .map_err(|e| SpawnError::SessionCreateFailed(e.to_string()))?;
        Ok(SessionId(response.id))
    }

    async fn session_prompt(&self, id: &SessionId, agent: &str, parts: &[String]) -> Result<(), SpawnError> {
        let body = serde_json::json!({ "agent": agent, "parts": parts });
        self.client
            .post(self.url(&format!("/session/{}/prompt", id.0)))
            .json(&body)
            .send()
            .await
            .map_err(|e| SpawnError::PromptFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| SpawnError::PromptFailed(e.to_string()))?;
        Ok(())
    }

    async fn session_prompt_async(&self, id: &SessionId, agent: &str, parts: &[String]) -> Result<(), SpawnError> {
        let body = serde_json::json!({ "agent": agent, "parts": parts, "async": true });
        self.client
            .post(self.url(&format!("/session/{}/prompt", id.0)))
            .json(&body)
            .send()
            .await
            .map_err(|e| SpawnError::PromptFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| SpawnError::PromptFailed(e.to_string()))?;
        Ok(())
    }

    async fn session_status(&self) -> HashMap<SessionId, RuntimeSessionState> {
        let response = match self.client.get(self.url("/session/status")).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "session_status request failed");
                return HashMap::new();
            }
        };
        let raw: HashMap<String, StatusEntry> = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "session_status parse failed");
                return HashMap::new();
            }
        };
        raw.into_iter()
            .map(|(id, entry)| {
                let state = if entry.kind == "busy" { RuntimeSessionState::Busy } else { RuntimeSessionState::Idle };
                (SessionId(id), state)
            })
            .collect()
    }

    async fn session_messages(&self, id: &SessionId) -> Result<Vec<RuntimeMessage>, SpawnError> {
        let messages: Vec<MessageEntry> = self
            .client
            .get(self.url(&format!("/session/{}/messages", id.0)))
            .send()
            .await
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?;
        Ok(messages.into_iter().map(|m| RuntimeMessage { role: m.role, text: m.text }).collect())
    }

    async fn session_children(&self, id: &SessionId) -> Result<Vec<SessionId>, SpawnError> {
        let children: Vec<String> = self
            .client
            .get(self.url(&format!("/session/{}/children", id.0)))
            .send()
            .await
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?
            .json()
            .await
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?;
        Ok(children.into_iter().map(SessionId).collect())
    }

    async fn session_delete(&self, id: &SessionId) -> Result<(), SpawnError> {
        self.client
            .delete(self.url(&format!("/session/{}", id.0)))
            .send()
            .await
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| SpawnError::AgentExecutionFailed(e.to_string()))?;
        Ok(())
    }
}
