//! Registered agents.

use crate::ids::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Voting power granted to agents that never had one assigned.
pub const DEFAULT_VOTING_POWER: u64 = 100;

/// Success rate assumed for agents without history.
pub const DEFAULT_SUCCESS_RATE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Value that binds an agent id to its identity configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityProof(String);

impl IdentityProof {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_voting_power")]
    pub voting_power: u64,
    /// Percentage in [0, 100].
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default)]
    pub total_requests: u64,
    pub status: AgentStatus,
    #[serde(default)]
    pub identity_proof: Option<IdentityProof>,
    #[serde(default)]
    pub reputation_score: Option<u32>,
    #[serde(default)]
    pub reputation_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages_processed: u64,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
}

fn default_voting_power() -> u64 {
    DEFAULT_VOTING_POWER
}

fn default_success_rate() -> f64 {
    DEFAULT_SUCCESS_RATE
}

impl Agent {
    /// A new active agent with default voting power and no identity proof.
    pub fn new(agent_id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            capabilities: BTreeSet::new(),
            voting_power: DEFAULT_VOTING_POWER,
            success_rate: DEFAULT_SUCCESS_RATE,
            total_requests: 0,
            status: AgentStatus::Active,
            identity_proof: None,
            reputation_score: None,
            reputation_updated_at: None,
            messages_processed: 0,
            registered_at: Utc::now(),
            last_active_at: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_voting_power(mut self, voting_power: u64) -> Self {
        self.voting_power = voting_power;
        self
    }

    pub fn with_history(mut self, success_rate: f64, total_requests: u64) -> Self {
        self.success_rate = success_rate;
        self.total_requests = total_requests;
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_identity_proof(mut self, proof: IdentityProof) -> Self {
        self.identity_proof = Some(proof);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn has_identity(&self) -> bool {
        self.identity_proof.is_some()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Most recent sign of life, used to order routing candidates.
    pub fn recency(&self) -> DateTime<Utc> {
        self.last_active_at.unwrap_or(self.registered_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_optional_fields_take_defaults() {
        let raw = serde_json::json!({
            "agent_id": "a-1",
            "name": "alpha",
            "status": "active",
            "registered_at": "2026-01-01T00:00:00Z"
        });
        let agent: Agent = serde_json::from_value(raw).unwrap();
        assert_eq!(agent.voting_power, DEFAULT_VOTING_POWER);
        assert_eq!(agent.success_rate, DEFAULT_SUCCESS_RATE);
        assert!(agent.capabilities.is_empty());
        assert!(!agent.has_identity());
    }

    #[test]
    fn recency_falls_back_to_registration() {
        let mut agent = Agent::new("a-1", "alpha");
        assert_eq!(agent.recency(), agent.registered_at);
        let later = agent.registered_at + chrono::Duration::minutes(5);
        agent.last_active_at = Some(later);
        assert_eq!(agent.recency(), later);
    }

    #[test]
    fn status_is_active_or_inactive() {
        let inactive: AgentStatus = serde_json::from_str("\"inactive\"").unwrap();
        assert_eq!(inactive, AgentStatus::Inactive);
        assert!(serde_json::from_str::<AgentStatus>("\"suspended\"").is_err());
    }
}
