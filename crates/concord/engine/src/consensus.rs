//! Stake-weighted consensus.
//!
//! A pending proposal opens a round with a frozen voter set and weight
//! table. Votes are tallied by weight; the round closes as accepted as soon
//! as approval reaches the threshold, and as rejected when the deadline
//! passes or every eligible voter has voted without reaching it.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use chrono::{DateTime, Utc};
use concord_storage::{AgentFilter, StorageError};
use concord_types::{
    message::VOTING_INVITATION, ActivityId, ActivityRecord, Agent, AgentId, ClaimOutcome,
    ConsensusRound, Message, MessageId, ProposalDisposition, ProposalId, ProposalOutcome,
    ProposalStatus, ProposalTransition, RoundId, RoundOutcome, RoundStatus, Tally, Vote,
    VoteChoice, VoteReceipt, VoteRejection, VotingWeight,
};
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const PROPOSAL_PROCESSED: &str = "proposal_processed";

/// `final_weight = round(voting_power * clamp(score / divisor, min, max))`.
pub fn voting_weight(voting_power: u64, score: u32, config: &EngineConfig) -> VotingWeight {
    let raw = if config.multiplier_divisor > 0.0 {
        f64::from(score) / config.multiplier_divisor
    } else {
        config.multiplier_max
    };
    let multiplier = raw.clamp(config.multiplier_min, config.multiplier_max);
    VotingWeight {
        base_weight: voting_power,
        reputation_multiplier: multiplier,
        final_weight: (voting_power as f64 * multiplier).round() as u64,
        reputation_score: score,
    }
}

pub fn is_eligible(weight: &VotingWeight, config: &EngineConfig) -> bool {
    weight.final_weight >= config.min_voting_weight
        && weight.reputation_score >= config.min_voter_reputation
}

/// Round decision for the current tally, if one is due.
pub fn decide(tally: &Tally, threshold_percent: u8, deadline_passed: bool) -> Option<RoundOutcome> {
    if tally.meets_threshold(threshold_percent) {
        Some(RoundOutcome::Accepted)
    } else if deadline_passed || tally.all_voted() {
        Some(RoundOutcome::Rejected)
    } else {
        None
    }
}

impl Engine {
    /// Open voting on a pending proposal. Re-processing returns the stored
    /// outcome flagged as a replay.
    pub async fn process_proposal(&self, proposal_id: &ProposalId) -> EngineResult<ProposalOutcome> {
        let claim = self
            .io(
                "claim_proposal",
                self.store.claim_proposal(
                    proposal_id,
                    &self.worker_id,
                    Utc::now(),
                    self.config.claim_ttl(),
                ),
            )
            .await;

        match claim {
            Ok(ClaimOutcome::Acquired) => {}
            Ok(ClaimOutcome::Finished) => return self.replay_proposal(proposal_id).await,
            Ok(ClaimOutcome::Contended { owner, .. }) => {
                return Ok(ProposalOutcome::new(
                    proposal_id.clone(),
                    ProposalDisposition::InProgress,
                    ProposalStatus::Pending,
                )
                .with_reason(format!("proposal is being processed by {owner}")));
            }
            Err(EngineError::Store(StorageError::NotFound(_))) => {
                return Err(EngineError::NotFound(format!("proposal {proposal_id}")));
            }
            Err(e) => {
                tracing::warn!(proposal_id = %proposal_id, error = %e, "Could not claim proposal");
                return Ok(proposal_failure(proposal_id, &e));
            }
        }

        match self.open_voting(proposal_id).await {
            Ok(outcome) => {
                tracing::info!(
                    proposal_id = %proposal_id,
                    disposition = ?outcome.disposition,
                    voters = outcome.eligible_voters.len(),
                    "Proposal processed"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(proposal_id = %proposal_id, error = %e, "Proposal processing failed");
                let outcome = proposal_failure(proposal_id, &e);
                if let Err(release_err) = self
                    .io(
                        "release_proposal",
                        self.store.release_proposal(
                            proposal_id,
                            &self.worker_id,
                            Some(outcome.clone()),
                        ),
                    )
                    .await
                {
                    tracing::warn!(proposal_id = %proposal_id, error = %release_err, "Failed to release proposal lease");
                }
                Ok(outcome)
            }
        }
    }

    async fn replay_proposal(&self, proposal_id: &ProposalId) -> EngineResult<ProposalOutcome> {
        let proposal = self
            .io("get_proposal", self.store.get_proposal(proposal_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("proposal {proposal_id}")))?;

        let mut outcome = match proposal.outcome {
            Some(outcome) => outcome,
            None => {
                let disposition = match proposal.status {
                    ProposalStatus::Invalid => ProposalDisposition::Invalid,
                    ProposalStatus::NoVoters => ProposalDisposition::NoVoters,
                    _ => ProposalDisposition::VotingStarted,
                };
                let mut outcome =
                    ProposalOutcome::new(proposal_id.clone(), disposition, proposal.status);
                outcome.consensus_round_id = proposal.round_id.clone();
                outcome
            }
        };
        outcome.proposal_status = proposal.status;
        outcome.replayed = true;
        Ok(outcome)
    }

    async fn open_voting(&self, proposal_id: &ProposalId) -> EngineResult<ProposalOutcome> {
        let proposal = self
            .io("get_proposal", self.store.get_proposal(proposal_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("proposal {proposal_id}")))?;

        let proposer = self
            .io("get_agent", self.store.get_agent(&proposal.proposer_id))
            .await?;
        let admission = match proposer {
            None => Err(format!("proposer {} is not registered", proposal.proposer_id)),
            Some(ref agent) => self.identity.verify(agent).map_err(|e| e.to_string()),
        };
        if let Err(reason) = admission {
            let outcome = ProposalOutcome::new(
                proposal_id.clone(),
                ProposalDisposition::Invalid,
                ProposalStatus::Invalid,
            )
            .with_reason(reason.clone());
            self.finish_pending(
                proposal_id,
                ProposalTransition::to(ProposalStatus::Invalid)
                    .with_reason(reason)
                    .with_outcome(outcome.clone()),
            )
            .await?;
            return Ok(outcome);
        }

        let round = match self
            .io(
                "open_round_for_proposal",
                self.store.open_round_for_proposal(proposal_id),
            )
            .await?
        {
            // Left behind by an attempt that died before the status change.
            Some(round) => round,
            None => {
                let weights = self.eligible_weights().await?;
                if weights.is_empty() {
                    let reason = EngineError::NoEligibleVoters.to_string();
                    let outcome = ProposalOutcome::new(
                        proposal_id.clone(),
                        ProposalDisposition::NoVoters,
                        ProposalStatus::NoVoters,
                    )
                    .with_reason(reason.clone());
                    self.finish_pending(
                        proposal_id,
                        ProposalTransition::to(ProposalStatus::NoVoters)
                            .with_reason(reason)
                            .with_outcome(outcome.clone()),
                    )
                    .await?;
                    return Ok(outcome);
                }
                self.create_round(proposal_id, weights).await?
            }
        };

        self.send_invitations(&proposal.title, &round).await?;

        let mut outcome = ProposalOutcome::new(
            proposal_id.clone(),
            ProposalDisposition::VotingStarted,
            ProposalStatus::Voting,
        );
        outcome.consensus_round_id = Some(round.round_id.clone());
        outcome.eligible_voters = round.eligible_voters.clone();
        outcome.voting_deadline = Some(round.voting_deadline);

        self.finish_pending(
            proposal_id,
            ProposalTransition::to(ProposalStatus::Voting)
                .with_round(round.round_id.clone())
                .with_outcome(outcome.clone()),
        )
        .await?;

        self.record_activity(ActivityRecord::confirmed(
            ActivityId::proposal_processed(proposal_id),
            proposal.proposer_id.clone(),
            PROPOSAL_PROCESSED,
            json!({
                "proposal_id": proposal_id,
                "round_id": round.round_id,
                "eligible_voters": round.eligible_voters.len(),
            }),
        ))
        .await?;

        Ok(outcome)
    }

    /// Pending -> `change.to`. A false CAS means another path already moved
    /// the proposal on; that is logged, not an error.
    async fn finish_pending(
        &self,
        proposal_id: &ProposalId,
        change: ProposalTransition,
    ) -> EngineResult<()> {
        let to = change.to;
        let applied = self
            .io(
                "transition_proposal",
                self.store.transition_proposal(
                    proposal_id,
                    &[ProposalStatus::Pending],
                    change,
                    Utc::now(),
                ),
            )
            .await?;
        if !applied {
            tracing::warn!(proposal_id = %proposal_id, to = %to, "Proposal left pending before transition");
        }
        Ok(())
    }

    /// Weights of every active, identity-verified agent that clears the
    /// eligibility bars. Scores are computed concurrently.
    async fn eligible_weights(&self) -> EngineResult<BTreeMap<AgentId, VotingWeight>> {
        let agents = self
            .io(
                "list_agents",
                self.store.list_agents(AgentFilter {
                    active_only: true,
                    ..AgentFilter::default()
                }),
            )
            .await?;
        let verified: Vec<Agent> = agents
            .into_iter()
            .filter(|a| self.identity.verify(a).is_ok())
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.dispatch_concurrency.max(1)));
        let scoring = verified.into_iter().map(|agent| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Timeout { operation: "score_agent" })?;
                let score = self.score_agent(&agent).await?;
                Ok::<_, EngineError>((agent, score))
            }
        });

        let mut weights = BTreeMap::new();
        for result in join_all(scoring).await {
            let (agent, score) = result?;
            let power = if agent.voting_power == 0 {
                self.config.default_voting_power
            } else {
                agent.voting_power
            };
            let weight = voting_weight(power, score, &self.config);
            if is_eligible(&weight, &self.config) {
                weights.insert(agent.agent_id, weight);
            }
        }
        Ok(weights)
    }

    async fn create_round(
        &self,
        proposal_id: &ProposalId,
        weights: BTreeMap<AgentId, VotingWeight>,
    ) -> EngineResult<ConsensusRound> {
        let now = Utc::now();
        let round = ConsensusRound {
            round_id: RoundId::for_proposal(proposal_id),
            proposal_id: proposal_id.clone(),
            eligible_voters: weights.keys().cloned().collect(),
            voting_weights: weights,
            consensus_threshold: self.config.consensus_threshold_percent,
            voting_deadline: now + self.config.voting_period(),
            status: RoundStatus::Voting,
            outcome: None,
            created_at: now,
            closed_at: None,
        };

        match self.io("insert_round", self.store.insert_round(round.clone())).await {
            Ok(()) => Ok(round),
            Err(EngineError::Store(StorageError::Conflict(_))) => self
                .io(
                    "open_round_for_proposal",
                    self.store.open_round_for_proposal(proposal_id),
                )
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("open round for {proposal_id}"))),
            Err(e) => Err(e),
        }
    }

    /// One invitation per eligible voter. Ids are deterministic, so an
    /// invitation stored by an earlier attempt is not sent twice.
    async fn send_invitations(&self, title: &str, round: &ConsensusRound) -> EngineResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.dispatch_concurrency.max(1)));
        let voters: Vec<(AgentId, VotingWeight)> = round
            .voting_weights
            .iter()
            .map(|(agent_id, weight)| (agent_id.clone(), *weight))
            .collect();
        let sends = voters.into_iter().map(|(agent_id, weight)| {
            let semaphore = semaphore.clone();
            let invitation = Message::system(
                MessageId::voting_invitation(&round.proposal_id, &agent_id),
                agent_id.clone(),
                VOTING_INVITATION,
                json!({
                    "proposal_id": round.proposal_id,
                    "round_id": round.round_id,
                    "title": title,
                    "voting_weight": weight.final_weight,
                    "voting_deadline": round.voting_deadline,
                }),
                Some(round.voting_deadline),
            );
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Timeout { operation: "insert_message" })?;
                match self.io("insert_message", self.store.insert_message(invitation)).await {
                    Ok(()) => {}
                    Err(EngineError::Store(StorageError::Conflict(_))) => {}
                    Err(e) => return Err(e),
                }
                self.emit(EngineEvent::VotingInvitation {
                    agent_id,
                    proposal_id: round.proposal_id.clone(),
                    round_id: round.round_id.clone(),
                    weight: weight.final_weight,
                    deadline: round.voting_deadline,
                });
                Ok(())
            }
        });

        join_all(sends).await.into_iter().collect()
    }

    /// Record a vote. Rejections come back as receipts, never as errors;
    /// only an unknown proposal is an error.
    pub async fn cast_vote(
        &self,
        agent_id: &AgentId,
        proposal_id: &ProposalId,
        choice: VoteChoice,
        reasoning: impl Into<String>,
    ) -> EngineResult<VoteReceipt> {
        let proposal = self
            .io("get_proposal", self.store.get_proposal(proposal_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("proposal {proposal_id}")))?;

        let round = match self
            .io(
                "open_round_for_proposal",
                self.store.open_round_for_proposal(proposal_id),
            )
            .await?
        {
            Some(round) => round,
            None => {
                let rejection = if proposal.round_id.is_some() {
                    VoteRejection::RoundClosed
                } else {
                    VoteRejection::NoActiveRound
                };
                return Ok(VoteReceipt::rejected(rejection, proposal.status));
            }
        };

        let now = Utc::now();
        if round.deadline_passed(now) {
            let (tally, round_status, proposal_status) = self.evaluate_round(&round, now).await?;
            return Ok(VoteReceipt {
                accepted: false,
                rejection: Some(VoteRejection::DeadlinePassed),
                tally: Some(tally),
                round_status: Some(round_status),
                proposal_status,
            });
        }

        let Some(weight) = round.weight_of(agent_id) else {
            return Ok(VoteReceipt {
                round_status: Some(round.status),
                ..VoteReceipt::rejected(VoteRejection::NotEligible, proposal.status)
            });
        };

        let vote = Vote {
            agent_id: agent_id.clone(),
            proposal_id: proposal_id.clone(),
            round_id: round.round_id.clone(),
            choice,
            reasoning: reasoning.into(),
            weight,
            cast_at: now,
        };
        let rejection = match self.io("insert_vote", self.store.insert_vote(vote)).await {
            Ok(()) => None,
            Err(EngineError::Store(StorageError::Conflict(_))) => Some(VoteRejection::DuplicateVote),
            Err(e) => return Err(e),
        };

        if rejection.is_none() {
            tracing::info!(proposal_id = %proposal_id, agent_id = %agent_id, choice = %choice, weight, "Vote recorded");
        }

        let (tally, round_status, proposal_status) = self.evaluate_round(&round, now).await?;
        Ok(VoteReceipt {
            accepted: rejection.is_none(),
            rejection,
            tally: Some(tally),
            round_status: Some(round_status),
            proposal_status,
        })
    }

    /// Tally `round` and close it if a decision is due.
    pub(crate) async fn evaluate_round(
        &self,
        round: &ConsensusRound,
        now: DateTime<Utc>,
    ) -> EngineResult<(Tally, RoundStatus, ProposalStatus)> {
        let votes = self
            .io("list_votes", self.store.list_votes(&round.round_id))
            .await?;
        let tally = Tally::from_votes(&votes, round.eligible_voters.len());

        let Some(outcome) = decide(&tally, round.consensus_threshold, round.deadline_passed(now))
        else {
            return Ok((tally, RoundStatus::Voting, ProposalStatus::Voting));
        };

        let closed = self
            .io(
                "close_round",
                self.store.close_round(&round.round_id, outcome, now),
            )
            .await?;

        if closed {
            let status = match outcome {
                RoundOutcome::Accepted => ProposalStatus::Accepted,
                RoundOutcome::Rejected => ProposalStatus::Rejected,
            };
            let reason = format!(
                "approval {:.1}% against threshold {}%",
                tally.approval_percent(),
                round.consensus_threshold
            );
            let moved = self
                .io(
                    "transition_proposal",
                    self.store.transition_proposal(
                        &round.proposal_id,
                        &[ProposalStatus::Voting, ProposalStatus::Pending],
                        ProposalTransition::to(status).with_reason(reason),
                        now,
                    ),
                )
                .await?;
            if !moved {
                tracing::warn!(proposal_id = %round.proposal_id, "Proposal was not in voting when its round closed");
            }
            tracing::info!(
                round_id = %round.round_id,
                proposal_id = %round.proposal_id,
                outcome = %outcome,
                approve = tally.approve_weight,
                cast = tally.cast_weight(),
                "Consensus round closed"
            );
            self.emit(EngineEvent::RoundClosed {
                round_id: round.round_id.clone(),
                proposal_id: round.proposal_id.clone(),
                outcome,
                tally,
            });
        }

        let proposal_status = self
            .io("get_proposal", self.store.get_proposal(&round.proposal_id))
            .await?
            .map(|p| p.status)
            .unwrap_or(ProposalStatus::Voting);
        Ok((tally, RoundStatus::Closed, proposal_status))
    }
}

fn proposal_failure(proposal_id: &ProposalId, error: &EngineError) -> ProposalOutcome {
    let outcome = ProposalOutcome::new(
        proposal_id.clone(),
        ProposalDisposition::Failed,
        ProposalStatus::Pending,
    )
    .with_reason(error.to_string());
    if error.is_transient() {
        outcome.retryable()
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_follow_reputation_multiplier() {
        let config = EngineConfig::default();
        let a = voting_weight(100, 650, &config);
        assert_eq!(a.reputation_multiplier, 1.3);
        assert_eq!(a.final_weight, 130);

        let b = voting_weight(200, 100, &config);
        assert_eq!(b.reputation_multiplier, 0.5);
        assert_eq!(b.final_weight, 100);

        let c = voting_weight(100, 1000, &config);
        assert_eq!(c.final_weight, 200);
    }

    #[test]
    fn eligibility_needs_weight_and_reputation() {
        let config = EngineConfig::default();
        assert!(is_eligible(&voting_weight(100, 650, &config), &config));
        // weight 100 but reputation under 400
        assert!(!is_eligible(&voting_weight(200, 100, &config), &config));
        // reputation fine but weight 40
        assert!(!is_eligible(&voting_weight(40, 500, &config), &config));
    }

    #[test]
    fn decision_rules() {
        let accepted = Tally {
            approve_weight: 130,
            eligible_voters: 2,
            votes_cast: 1,
            ..Tally::default()
        };
        assert_eq!(decide(&accepted, 60, false), Some(RoundOutcome::Accepted));

        let short = Tally {
            approve_weight: 50,
            reject_weight: 50,
            eligible_voters: 3,
            votes_cast: 2,
            ..Tally::default()
        };
        assert_eq!(decide(&short, 60, false), None);
        assert_eq!(decide(&short, 60, true), Some(RoundOutcome::Rejected));

        let everyone = Tally {
            eligible_voters: 2,
            ..short
        };
        assert_eq!(decide(&everyone, 60, false), Some(RoundOutcome::Rejected));

        let silent = Tally {
            eligible_voters: 2,
            ..Tally::default()
        };
        assert_eq!(decide(&silent, 60, true), Some(RoundOutcome::Rejected));
    }
}
