//! Component-local error enums plus the top-level aggregate.
//!
//! Propagation policy: component-local failures that do not compromise
//! invariants are converted into `Result` values and logged at `warn`;
//! failures that would corrupt the event log or the ledger are surfaced as
//! exceptions to the caller. Supervisor ticks never abort on a component
//! error.

use thiserror::Error;

use super::{CheckpointId, EventId, TaskId};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream unavailable: {reason}")]
    StreamUnavailable { reason: String },
    #[error("failed to rotate segment: {reason}")]
    RotationFailed { reason: String },
    #[error("malformed event record at offset {offset}: {reason}")]
    MalformedRecord { offset: u64, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: TaskId },
    #[error("invalid status transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition { task_id: TaskId, from: String, to: String },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("spawn error: {0}")]
    Spawn(#[from] SpawnError),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to acquire ledger file lock after {attempts} attempts")]
    LockTimeout { attempts: u32 },
    #[error("failed to parse ledger: {reason}")]
    ParseFailed { reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Spawner/Coordinator error taxonomy: a closed set of tagged variants so
/// callers and logs can match on them by tag.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("NO_CONTEXT: {0}")]
    NoContext(String),
    #[error("MISSING_ARGUMENT: {0}")]
    MissingArgument(String),
    #[error("AGENT_NOT_FOUND: {0}")]
    AgentNotFound(String),
    #[error("ACCESS_DENIED: {0}")]
    AccessDenied(String),
    #[error("RECURSION_DETECTED: agent {agent} already in execution stack or stack too deep")]
    RecursionDetected { agent: String },
    #[error("SESSION_CREATE_FAILED: {0}")]
    SessionCreateFailed(String),
    #[error("PROMPT_FAILED: {0}")]
    PromptFailed(String),
    #[error("AGENT_EXECUTION_FAILED: {0}")]
    AgentExecutionFailed(String),
    #[error("SPAWN_FAILED: {0}")]
    SpawnFailed(String),
}

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {checkpoint_id} not found")]
    NotFound { checkpoint_id: CheckpointId },
    #[error("checkpoint {checkpoint_id} already resolved")]
    AlreadyResolved { checkpoint_id: CheckpointId },
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Debug, Error)]
pub enum LearningError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("RecoveryFailed: {0}")]
    RecoveryFailed(String),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("stream: {0}")]
    Stream(#[from] StreamError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("supervisor: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("spawn: {0}")]
    Spawn(#[from] SpawnError),
    #[error("actor: {0}")]
    Actor(#[from] ActorError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("learning: {0}")]
    Learning(#[from] LearningError),
    #[error("recovery: {0}")]
    Recovery(#[from] RecoveryError),
    #[error("StreamUnavailable: {0}")]
    StreamUnavailable(String),
    #[error("RecoveryFailed: {0}")]
    RecoveryFailed(String),
    #[error("configuration error: {0}")]
    Config(String),
}
