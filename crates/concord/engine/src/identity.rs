//! Identity verification.
//!
//! An agent's identity proof must equal a deterministic derivation of its
//! id. The derivation is pluggable; the default hashes the id with SHA-256
//! and keeps a 40-hex-char, address-like prefix.

use crate::error::IdentityError;
use concord_types::{Agent, AgentId, IdentityProof};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Deterministic mapping from agent id to identity proof.
pub trait IdentityScheme: Send + Sync {
    fn derive(&self, agent_id: &AgentId) -> IdentityProof;
}

/// `0x` followed by the first 40 hex chars of SHA-256(agent_id).
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Identity;

impl IdentityScheme for Sha256Identity {
    fn derive(&self, agent_id: &AgentId) -> IdentityProof {
        let mut hasher = Sha256::new();
        hasher.update(agent_id.as_str().as_bytes());
        let digest = hex::encode(hasher.finalize());
        IdentityProof::new(format!("0x{}", &digest[..40]))
    }
}

/// Checks agents against an [`IdentityScheme`].
#[derive(Clone)]
pub struct IdentityVerifier {
    scheme: Arc<dyn IdentityScheme>,
}

impl Default for IdentityVerifier {
    fn default() -> Self {
        Self::new(Arc::new(Sha256Identity))
    }
}

impl IdentityVerifier {
    pub fn new(scheme: Arc<dyn IdentityScheme>) -> Self {
        Self { scheme }
    }

    pub fn derive(&self, agent_id: &AgentId) -> IdentityProof {
        self.scheme.derive(agent_id)
    }

    /// Pure check; reads nothing besides the agent record.
    pub fn verify(&self, agent: &Agent) -> Result<(), IdentityError> {
        let proof = agent
            .identity_proof
            .as_ref()
            .ok_or_else(|| IdentityError::NotConfigured(agent.agent_id.to_string()))?;

        if *proof != self.derive(&agent.agent_id) {
            return Err(IdentityError::Mismatch(agent.agent_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_address_shaped() {
        let scheme = Sha256Identity;
        let a = scheme.derive(&AgentId::new("agent-1"));
        let b = scheme.derive(&AgentId::new("agent-1"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 42);
        assert!(a.as_str().starts_with("0x"));
        assert_ne!(a, scheme.derive(&AgentId::new("agent-2")));
    }

    #[test]
    fn missing_proof_is_not_configured() {
        let verifier = IdentityVerifier::default();
        let agent = Agent::new("a-1", "alpha");
        assert_eq!(
            verifier.verify(&agent),
            Err(IdentityError::NotConfigured("a-1".into()))
        );
    }

    #[test]
    fn foreign_proof_is_a_mismatch() {
        let verifier = IdentityVerifier::default();
        let other = verifier.derive(&AgentId::new("someone-else"));
        let agent = Agent::new("a-1", "alpha").with_identity_proof(other);
        assert_eq!(
            verifier.verify(&agent),
            Err(IdentityError::Mismatch("a-1".into()))
        );
        assert!(verifier.verify(&agent).unwrap_err().to_string().contains("mismatch"));
    }

    #[test]
    fn matching_proof_passes() {
        let verifier = IdentityVerifier::default();
        let agent = Agent::new("a-1", "alpha").with_identity_proof(verifier.derive(&AgentId::new("a-1")));
        assert!(verifier.verify(&agent).is_ok());
    }

    struct Upper;

    impl IdentityScheme for Upper {
        fn derive(&self, agent_id: &AgentId) -> IdentityProof {
            IdentityProof::new(agent_id.as_str().to_uppercase())
        }
    }

    #[test]
    fn scheme_is_pluggable() {
        let verifier = IdentityVerifier::new(Arc::new(Upper));
        let agent = Agent::new("abc", "x").with_identity_proof(IdentityProof::new("ABC"));
        assert!(verifier.verify(&agent).is_ok());
    }
}
