//! The engine service object.
//!
//! Constructed once at process start and shared as `Arc<Engine>` between
//! the change consumer, the scheduler, the runner pool and the REST layer.
//! It holds no correctness state of its own: every decision is re-derived
//! from the store, so the process can be killed and restarted at any point.

use crate::config::{EngineConfig, SchedulerConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::identity::{IdentityScheme, IdentityVerifier};
use chrono::Utc;
use concord_storage::{ConcordStore, StorageResult};
use concord_types::{
    Agent, AgentId, HealthReport, HealthState, Message, MessageId, Proposal, ProposalId,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

pub struct Engine {
    pub(crate) store: Arc<dyn ConcordStore>,
    pub(crate) config: EngineConfig,
    pub(crate) sweeps: SchedulerConfig,
    pub(crate) identity: IdentityVerifier,
    pub(crate) events: broadcast::Sender<EngineEvent>,
    /// Lease owner name for claims taken by this process.
    pub(crate) worker_id: String,
}

impl Engine {
    pub fn new(store: Arc<dyn ConcordStore>, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            config,
            sweeps: SchedulerConfig::default(),
            identity: IdentityVerifier::default(),
            events,
            worker_id: format!("engine-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_scheduler_config(mut self, sweeps: SchedulerConfig) -> Self {
        self.sweeps = sweeps;
        self
    }

    pub fn with_identity_scheme(mut self, scheme: Arc<dyn IdentityScheme>) -> Self {
        self.identity = IdentityVerifier::new(scheme);
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.sweeps
    }

    pub fn store(&self) -> &Arc<dyn ConcordStore> {
        &self.store
    }

    pub fn identity(&self) -> &IdentityVerifier {
        &self.identity
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        // No listeners is fine; the store already holds the state.
        let _ = self.events.send(event);
    }

    /// Run a store call under the configured timeout.
    pub(crate) async fn io<T, F>(&self, operation: &'static str, fut: F) -> EngineResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout(), fut).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::Timeout { operation }),
        }
    }

    /// Register (or re-register) an agent, deriving its identity proof.
    pub async fn register_agent(&self, mut agent: Agent) -> EngineResult<Agent> {
        agent.identity_proof = Some(self.identity.derive(&agent.agent_id));
        self.io("upsert_agent", self.store.upsert_agent(agent.clone()))
            .await?;
        tracing::info!(agent_id = %agent.agent_id, "Agent registered");
        Ok(agent)
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> EngineResult<Agent> {
        self.io("get_agent", self.store.get_agent(agent_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")))
    }

    /// Store a new agent message. The change feed announces it to the router.
    pub async fn submit_message(&self, message: Message) -> EngineResult<MessageId> {
        let id = message.message_id.clone();
        self.io("insert_message", self.store.insert_message(message))
            .await?;
        Ok(id)
    }

    pub async fn submit_proposal(&self, proposal: Proposal) -> EngineResult<ProposalId> {
        let id = proposal.proposal_id.clone();
        self.io("insert_proposal", self.store.insert_proposal(proposal))
            .await?;
        Ok(id)
    }

    /// Store connectivity. Never fails; problems are reported in the result.
    pub async fn health_check(&self) -> HealthReport {
        let checked_at = Utc::now();
        match self.io("ping", self.store.ping()).await {
            Ok(()) => HealthReport {
                status: HealthState::Healthy,
                database_connected: true,
                error: None,
                checked_at,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Health check failed");
                HealthReport {
                    status: HealthState::Unhealthy,
                    database_connected: false,
                    error: Some(e.to_string()),
                    checked_at,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_storage::InMemoryConcordStore;

    fn engine() -> (Arc<InMemoryConcordStore>, Engine) {
        let store = Arc::new(InMemoryConcordStore::new());
        let engine = Engine::new(store.clone(), EngineConfig::default());
        (store, engine)
    }

    #[tokio::test]
    async fn register_derives_identity() {
        let (_store, engine) = engine();
        let agent = engine.register_agent(Agent::new("a-1", "alpha")).await.unwrap();
        assert!(engine.identity().verify(&agent).is_ok());

        let stored = engine.get_agent(&AgentId::new("a-1")).await.unwrap();
        assert_eq!(stored.identity_proof, agent.identity_proof);
    }

    #[tokio::test]
    async fn missing_agent_is_not_found() {
        let (_store, engine) = engine();
        let err = engine.get_agent(&AgentId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn health_reflects_store_availability() {
        let (store, engine) = engine();
        let report = engine.health_check().await;
        assert!(report.is_healthy());
        assert!(report.database_connected);

        store.set_offline(true);
        let report = engine.health_check().await;
        assert_eq!(report.status, HealthState::Unhealthy);
        assert!(!report.database_connected);
        assert!(report.error.is_some());
    }
}
