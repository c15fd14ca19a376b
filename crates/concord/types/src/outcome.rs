//! Structured results of the engine operations.
//!
//! Gate failures (identity, reputation, no voters) are reported through
//! these types rather than as errors, so callers always get a status
//! object back.

use crate::consensus::{RoundStatus, Tally};
use crate::ids::{AgentId, MessageId, ProposalId, RoundId};
use crate::proposal::ProposalStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    Medium,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Processed,
    Failed,
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageOutcome {
    pub message_id: MessageId,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reputation_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub target_agents: Vec<AgentId>,
    #[serde(default)]
    pub tasks_created: usize,
    /// Set on transient failures; the stale sweep will try again.
    #[serde(default)]
    pub retryable: bool,
    /// The message had already been processed; this is the stored result.
    #[serde(default)]
    pub replayed: bool,
    pub decided_at: DateTime<Utc>,
}

impl MessageOutcome {
    pub fn new(message_id: MessageId, status: MessageStatus) -> Self {
        Self {
            message_id,
            status,
            reason: None,
            reputation_score: None,
            priority: None,
            target_agents: Vec::new(),
            tasks_created: 0,
            retryable: false,
            replayed: false,
            decided_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_score(mut self, score: u32) -> Self {
        self.reputation_score = Some(score);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn replayed(mut self) -> Self {
        self.replayed = true;
        self
    }

    /// Everything except a retryable failure is final.
    pub fn is_final(&self) -> bool {
        !(self.status == MessageStatus::Failed && self.retryable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalDisposition {
    VotingStarted,
    Invalid,
    NoVoters,
    /// Transient failure; the proposal stays pending.
    Failed,
    /// Another worker owns the proposal right now.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalOutcome {
    pub proposal_id: ProposalId,
    pub disposition: ProposalDisposition,
    pub proposal_status: ProposalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_round_id: Option<RoundId>,
    #[serde(default)]
    pub eligible_voters: Vec<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voting_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub replayed: bool,
    pub decided_at: DateTime<Utc>,
}

impl ProposalOutcome {
    pub fn new(
        proposal_id: ProposalId,
        disposition: ProposalDisposition,
        proposal_status: ProposalStatus,
    ) -> Self {
        Self {
            proposal_id,
            disposition,
            proposal_status,
            reason: None,
            consensus_round_id: None,
            eligible_voters: Vec::new(),
            voting_deadline: None,
            retryable: false,
            replayed: false,
            decided_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// Summary of one proactive pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProactiveReport {
    pub actions_performed: usize,
    pub actions: Vec<String>,
    /// Sweeps or items that failed; everything else still ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl ProactiveReport {
    pub fn push(&mut self, action: impl Into<String>) {
        self.actions.push(action.into());
        self.actions_performed = self.actions.len();
    }

    pub fn merge(&mut self, other: ProactiveReport) {
        self.actions.extend(other.actions);
        self.failures.extend(other.failures);
        self.actions_performed = self.actions.len();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub database_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Why a vote was not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteRejection {
    NoActiveRound,
    RoundClosed,
    DeadlinePassed,
    NotEligible,
    DuplicateVote,
}

impl fmt::Display for VoteRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VoteRejection::NoActiveRound => "proposal has no active voting round",
            VoteRejection::RoundClosed => "voting round is closed",
            VoteRejection::DeadlinePassed => "voting deadline has passed",
            VoteRejection::NotEligible => "agent is not an eligible voter for this round",
            VoteRejection::DuplicateVote => "agent already voted on this proposal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<VoteRejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tally: Option<Tally>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_status: Option<RoundStatus>,
    pub proposal_status: ProposalStatus,
}

impl VoteReceipt {
    pub fn rejected(rejection: VoteRejection, proposal_status: ProposalStatus) -> Self {
        Self {
            accepted: false,
            rejection: Some(rejection),
            tally: None,
            round_status: None,
            proposal_status,
        }
    }
}
