//! On-disk orchestrator configuration: one `serde` + `toml`, `Default`-derived
//! sub-config struct per component, aggregated and validated at load time.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_stream_path() -> PathBuf {
    PathBuf::from(".opencode/orchestration_stream.jsonl")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".opencode/checkpoints")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".opencode/LEDGER.md")
}

fn default_actor_state_path() -> PathBuf {
    PathBuf::from(".opencode/actor-state.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub stream_path: PathBuf,
    pub max_stream_size_mb: u64,
    pub history_ring_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_path: default_stream_path(),
            max_stream_size_mb: 10,
            history_ring_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub default_max_retries: u32,
    pub default_timeout_ms: u64,
    pub cleanup_max_age_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 2,
            default_timeout_ms: 60_000,
            cleanup_max_age_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub stuck_threshold_ms: u64,
    pub verbose: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 30_000,
            max_interval_ms: 120_000,
            stuck_threshold_ms: 30_000,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub ledger_path: PathBuf,
    pub lock_retry_attempts: u32,
    pub learning_debounce_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            lock_retry_attempts: 5,
            learning_debounce_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnerConfig {
    pub enable_context_preservation: bool,
    pub max_learnings_in_context: usize,
    pub max_keywords: usize,
    /// Agents that are not marked public; only `coordinator_agent` may spawn
    /// them directly.
    pub internal_agents: Vec<String>,
    /// Native runtime agents are a passthrough for the access-control check.
    pub native_agents: Vec<String>,
    pub coordinator_agent: String,
    /// Agents configured as requiring explicit handoff context on spawn.
    pub context_required_agents: Vec<String>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            enable_context_preservation: true,
            max_learnings_in_context: 5,
            max_keywords: 8,
            internal_agents: Vec::new(),
            native_agents: Vec::new(),
            coordinator_agent: "coordinator".to_string(),
            context_required_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub checkpoint_path: PathBuf,
    pub max_checkpoints: usize,
    pub checkpoint_timeout_ms: u64,
    pub enable_human_in_loop: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: default_checkpoint_path(),
            max_checkpoints: 20,
            checkpoint_timeout_ms: 300_000,
            enable_human_in_loop: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub min_confidence: f32,
    pub max_learnings: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            max_learnings: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub stream: StreamConfig,
    pub registry: RegistryConfig,
    pub supervisor: SupervisorConfig,
    pub ledger: LedgerConfig,
    pub spawner: SpawnerConfig,
    pub checkpoint: CheckpointConfig,
    pub learning: LearningConfig,
    pub actor_state_path: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            registry: RegistryConfig::default(),
            supervisor: SupervisorConfig::default(),
            ledger: LedgerConfig::default(),
            spawner: SpawnerConfig::default(),
            checkpoint: CheckpointConfig::default(),
            learning: LearningConfig::default(),
            actor_state_path: default_actor_state_path(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Rejects nonsensical combinations before the orchestrator starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.supervisor.max_interval_ms < self.supervisor.base_interval_ms {
            return Err(format!(
                "supervisor.max_interval_ms ({}) must be >= base_interval_ms ({})",
                self.supervisor.max_interval_ms, self.supervisor.base_interval_ms
            ));
        }
        if self.registry.default_max_retries == 0 {
            tracing::warn!("registry.default_max_retries is 0; tasks will never retry");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_intervals_are_rejected() {
        let mut config = OrchestratorConfig::default();
        config.supervisor.max_interval_ms = 1;
        config.supervisor.base_interval_ms = 2;
        assert!(config.validate().is_err());
    }
}
