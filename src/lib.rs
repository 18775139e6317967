//! Orchestrator Core: a durable, resumable coordinator for agent tasks.
//!
//! Wires a durable event stream (system-of-record), a projected ledger, an
//! actor-style reducer over phase/assumption/direction state, a supervisor
//! with adaptive timeouts and retries, a checkpoint subsystem for
//! human-in-the-loop approvals, and cross-session learning extraction into a
//! single running [`Orchestrator`]. The conversational runtime that actually
//! executes agents is an external collaborator, reached only through the
//! [`spawner::runtime_client::RuntimeClient`] trait.

pub mod actor;
pub mod checkpoint;
pub mod config;
pub mod learning;
pub mod ledger;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod spawner;
pub mod stream;
pub mod supervisor;
pub mod time;
pub mod types;

pub use config::OrchestratorConfig;
pub use orchestrator::Orchestrator;
pub use types::{OrchestratorError, OrchestratorStatus};
