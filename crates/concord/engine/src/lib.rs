//! Concord engine.
//!
//! Routes agent messages to capable peers, runs stake- and
//! reputation-weighted voting on proposals, and keeps both moving through
//! periodic sweeps. All correctness state lives in the store behind
//! [`concord_storage::ConcordStore`]; the [`Engine`] itself can be dropped
//! and rebuilt at any time.
//!
//! Entry points:
//! - [`Engine::process_message`] and [`Engine::process_proposal`] for the
//!   reactive path (see [`consumer`])
//! - [`Engine::cast_vote`] for votes from runners or the REST layer
//! - [`Engine::run_proactive`] and the [`Scheduler`] for sweeps
//! - [`AgentRunnerPool`] to let agents act on engine events via an oracle

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod consensus;
pub mod consumer;
mod engine;
mod error;
pub mod events;
pub mod identity;
pub mod oracle;
pub mod reputation;
pub mod router;
pub mod runner;
pub mod scheduler;
mod sweeps;

pub use config::{EngineConfig, OracleConfig, PriorityBands, RunnerConfig, SchedulerConfig};
pub use consumer::{handle_change, spawn_change_consumer};
pub use engine::Engine;
pub use error::{EngineError, EngineResult, IdentityError, OracleError};
pub use events::EngineEvent;
pub use identity::{IdentityScheme, IdentityVerifier, Sha256Identity};
pub use oracle::{
    Decision, DecisionKind, DecisionOracle, OpenAiCompatibleOracle, OracleRequest, StaticOracle,
};
pub use reputation::{compute_score, ReputationInputs};
pub use runner::{AgentMemory, AgentRunner, AgentRunnerPool, RunnerAction};
pub use scheduler::Scheduler;
