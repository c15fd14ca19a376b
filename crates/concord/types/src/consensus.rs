//! Consensus rounds, voting weights and votes.

use crate::ids::{AgentId, ProposalId, RoundId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reputation-adjusted voting weight of one agent for one round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VotingWeight {
    pub base_weight: u64,
    pub reputation_multiplier: f64,
    pub final_weight: u64,
    pub reputation_score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Voting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundOutcome {
    Accepted,
    Rejected,
}

impl fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundOutcome::Accepted => f.write_str("accepted"),
            RoundOutcome::Rejected => f.write_str("rejected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRound {
    pub round_id: RoundId,
    pub proposal_id: ProposalId,
    /// Frozen when the round opens.
    pub eligible_voters: Vec<AgentId>,
    pub voting_weights: BTreeMap<AgentId, VotingWeight>,
    /// Approval percentage required, 0..=100.
    pub consensus_threshold: u8,
    pub voting_deadline: DateTime<Utc>,
    pub status: RoundStatus,
    #[serde(default)]
    pub outcome: Option<RoundOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl ConsensusRound {
    pub fn is_open(&self) -> bool {
        self.status == RoundStatus::Voting
    }

    pub fn is_eligible(&self, agent_id: &AgentId) -> bool {
        self.voting_weights.contains_key(agent_id)
    }

    pub fn weight_of(&self, agent_id: &AgentId) -> Option<u64> {
        self.voting_weights.get(agent_id).map(|w| w.final_weight)
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        now >= self.voting_deadline
    }

    /// Compare-and-set close. Only an open round closes.
    pub fn close(&mut self, outcome: RoundOutcome, now: DateTime<Utc>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.status = RoundStatus::Closed;
        self.outcome = Some(outcome);
        self.closed_at = Some(now);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Approve,
    Reject,
    Abstain,
}

impl fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteChoice::Approve => f.write_str("approve"),
            VoteChoice::Reject => f.write_str("reject"),
            VoteChoice::Abstain => f.write_str("abstain"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: AgentId,
    pub proposal_id: ProposalId,
    pub round_id: RoundId,
    pub choice: VoteChoice,
    #[serde(default)]
    pub reasoning: String,
    /// Weight snapshot from the round at the time of voting.
    pub weight: u64,
    pub cast_at: DateTime<Utc>,
}

/// Weighted vote totals for a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approve_weight: u64,
    pub reject_weight: u64,
    pub abstain_weight: u64,
    pub votes_cast: usize,
    pub eligible_voters: usize,
}

impl Tally {
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>, eligible_voters: usize) -> Self {
        let mut tally = Tally {
            eligible_voters,
            ..Tally::default()
        };
        for vote in votes {
            match vote.choice {
                VoteChoice::Approve => {
                    tally.approve_weight = tally.approve_weight.saturating_add(vote.weight)
                }
                VoteChoice::Reject => {
                    tally.reject_weight = tally.reject_weight.saturating_add(vote.weight)
                }
                VoteChoice::Abstain => {
                    tally.abstain_weight = tally.abstain_weight.saturating_add(vote.weight)
                }
            }
            tally.votes_cast += 1;
        }
        tally
    }

    /// Abstentions count towards the denominator.
    pub fn cast_weight(&self) -> u64 {
        self.approve_weight
            .saturating_add(self.reject_weight)
            .saturating_add(self.abstain_weight)
    }

    fn wide_cast_weight(&self) -> u128 {
        u128::from(self.approve_weight)
            + u128::from(self.reject_weight)
            + u128::from(self.abstain_weight)
    }

    pub fn approval_percent(&self) -> f64 {
        let cast = self.wide_cast_weight();
        if cast == 0 {
            return 0.0;
        }
        self.approve_weight as f64 * 100.0 / cast as f64
    }

    /// Integer comparison so a ratio exactly on the threshold passes.
    /// Widened to `u128` because stakes are unbounded.
    pub fn meets_threshold(&self, threshold_percent: u8) -> bool {
        let cast = self.wide_cast_weight();
        cast > 0
            && u128::from(self.approve_weight) * 100 >= u128::from(threshold_percent) * cast
    }

    pub fn all_voted(&self) -> bool {
        self.eligible_voters > 0 && self.votes_cast >= self.eligible_voters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(agent: &str, choice: VoteChoice, weight: u64) -> Vote {
        Vote {
            agent_id: AgentId::new(agent),
            proposal_id: ProposalId::new("p"),
            round_id: RoundId::new("r"),
            choice,
            reasoning: String::new(),
            weight,
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn abstain_counts_in_denominator() {
        let votes = [
            vote("a", VoteChoice::Approve, 60),
            vote("b", VoteChoice::Abstain, 40),
        ];
        let tally = Tally::from_votes(&votes, 3);
        assert_eq!(tally.cast_weight(), 100);
        assert!(tally.meets_threshold(60));
        assert!(!tally.meets_threshold(61));
        assert!(!tally.all_voted());
    }

    #[test]
    fn large_stakes_do_not_overflow() {
        let single = Tally::from_votes(
            &[vote("a", VoteChoice::Approve, 200_000_000_000_000_000)],
            1,
        );
        assert!(single.meets_threshold(60));
        assert!(single.meets_threshold(100));

        let votes = [
            vote("a", VoteChoice::Approve, 12_000_000_000_000_000_000),
            vote("b", VoteChoice::Reject, 8_000_000_000_000_000_000),
        ];
        let tally = Tally::from_votes(&votes, 2);
        assert!(tally.meets_threshold(60));
        assert!(!tally.meets_threshold(61));
        assert!((tally.approval_percent() - 60.0).abs() < 1e-9);
        assert_eq!(tally.cast_weight(), u64::MAX);

        let saturated = Tally::from_votes(
            &[
                vote("a", VoteChoice::Reject, u64::MAX),
                vote("b", VoteChoice::Reject, u64::MAX),
            ],
            2,
        );
        assert_eq!(saturated.reject_weight, u64::MAX);
        assert!(!saturated.meets_threshold(1));
    }

    #[test]
    fn empty_tally_never_meets_threshold() {
        let tally = Tally::from_votes(&[], 2);
        assert!(!tally.meets_threshold(0));
        assert_eq!(tally.approval_percent(), 0.0);
    }

    #[test]
    fn close_is_one_shot() {
        let now = Utc::now();
        let mut round = ConsensusRound {
            round_id: RoundId::new("r"),
            proposal_id: ProposalId::new("p"),
            eligible_voters: vec![],
            voting_weights: BTreeMap::new(),
            consensus_threshold: 60,
            voting_deadline: now,
            status: RoundStatus::Voting,
            outcome: None,
            created_at: now,
            closed_at: None,
        };
        assert!(round.close(RoundOutcome::Accepted, now));
        assert!(!round.close(RoundOutcome::Rejected, now));
        assert_eq!(round.outcome, Some(RoundOutcome::Accepted));
    }
}
