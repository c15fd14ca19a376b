//! Governance proposals.

use crate::claim::{self, Claim, ClaimOutcome};
use crate::ids::{AgentId, ProposalId, RoundId};
use crate::outcome::ProposalOutcome;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Proposal lifecycle.
///
/// `Pending -> Voting -> Accepted | Rejected`, or `Pending -> Invalid | NoVoters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Voting,
    Accepted,
    Rejected,
    Invalid,
    NoVoters,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Accepted
                | ProposalStatus::Rejected
                | ProposalStatus::Invalid
                | ProposalStatus::NoVoters
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Voting => "voting",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Invalid => "invalid",
            ProposalStatus::NoVoters => "no_voters",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub proposer_id: AgentId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub proposal_data: serde_json::Value,
    pub status: ProposalStatus,
    #[serde(default)]
    pub round_id: Option<RoundId>,
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Result of the last processing attempt.
    #[serde(default)]
    pub outcome: Option<ProposalOutcome>,
    #[serde(default)]
    pub claim: Option<Claim>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(proposer_id: impl Into<AgentId>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            proposal_id: ProposalId::generate(),
            proposer_id: proposer_id.into(),
            title: title.into(),
            description: String::new(),
            proposal_data: serde_json::Value::Null,
            status: ProposalStatus::Pending,
            round_id: None,
            status_reason: None,
            outcome: None,
            claim: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, proposal_id: impl Into<ProposalId>) -> Self {
        self.proposal_id = proposal_id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.proposal_data = data;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    pub fn try_claim(&mut self, owner: &str, now: DateTime<Utc>, ttl: Duration) -> ClaimOutcome {
        if self.status != ProposalStatus::Pending {
            return ClaimOutcome::Finished;
        }
        claim::try_acquire(&mut self.claim, owner, now, ttl)
    }

    /// Drop the lease, keeping `outcome` as the last attempt's result.
    pub fn release_claim(&mut self, owner: &str, outcome: Option<ProposalOutcome>) -> bool {
        if !claim::release(&mut self.claim, owner) {
            return false;
        }
        if outcome.is_some() {
            self.outcome = outcome;
        }
        true
    }

    /// Compare-and-set status change. Applies only when the current status
    /// is one of `expected`; any lease is dropped on success.
    pub fn transition(
        &mut self,
        expected: &[ProposalStatus],
        change: &ProposalTransition,
        now: DateTime<Utc>,
    ) -> bool {
        if !expected.contains(&self.status) {
            return false;
        }
        self.status = change.to;
        if let Some(round_id) = &change.round_id {
            self.round_id = Some(round_id.clone());
        }
        if change.reason.is_some() {
            self.status_reason = change.reason.clone();
        }
        if let Some(outcome) = &change.outcome {
            self.outcome = Some(outcome.clone());
        }
        self.claim = None;
        self.updated_at = now;
        true
    }
}

/// Target state of a proposal status change.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalTransition {
    pub to: ProposalStatus,
    pub round_id: Option<RoundId>,
    pub reason: Option<String>,
    pub outcome: Option<ProposalOutcome>,
}

impl ProposalTransition {
    pub fn to(status: ProposalStatus) -> Self {
        Self {
            to: status,
            round_id: None,
            reason: None,
            outcome: None,
        }
    }

    pub fn with_round(mut self, round_id: RoundId) -> Self {
        self.round_id = Some(round_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_outcome(mut self, outcome: ProposalOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_requires_expected_status() {
        let now = Utc::now();
        let mut p = Proposal::new("a-1", "raise quorum");
        assert!(!p.transition(
            &[ProposalStatus::Voting],
            &ProposalTransition::to(ProposalStatus::Accepted),
            now
        ));
        assert_eq!(p.status, ProposalStatus::Pending);

        let round = RoundId::new("r-1");
        assert!(p.transition(
            &[ProposalStatus::Pending],
            &ProposalTransition::to(ProposalStatus::Voting).with_round(round.clone()),
            now
        ));
        assert_eq!(p.status, ProposalStatus::Voting);
        assert_eq!(p.round_id, Some(round));
    }

    #[test]
    fn only_pending_proposals_are_claimable() {
        let now = Utc::now();
        let mut p = Proposal::new("a-1", "t");
        p.status = ProposalStatus::Voting;
        assert_eq!(
            p.try_claim("w", now, Duration::seconds(10)),
            ClaimOutcome::Finished
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(ProposalStatus::NoVoters.is_terminal());
        assert!(ProposalStatus::Rejected.is_terminal());
        assert!(!ProposalStatus::Voting.is_terminal());
        assert!(!ProposalStatus::Pending.is_terminal());
    }
}
