//! Periodic maintenance passes.
//!
//! Each sweep is safe to run concurrently with the reactive path and with
//! itself: retries go through the same leases, reminders and invitations
//! use deterministic ids, and round closing is a compare-and-set.

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use chrono::Utc;
use concord_storage::StorageError;
use concord_types::{
    message::VOTING_REMINDER, Message, MessageId, MessageStatus, ProactiveReport,
    ProposalDisposition,
};
use serde_json::json;

impl Engine {
    /// Run every sweep once. A failing sweep is reported and the rest
    /// still run; within a sweep, a failing item is reported and skipped.
    pub async fn run_proactive(&self) -> ProactiveReport {
        let mut report = ProactiveReport::default();

        let sweeps = [
            ("stale_messages", self.sweep_stale_messages().await),
            ("stale_proposals", self.sweep_stale_proposals().await),
            ("expired_rounds", self.sweep_expired_rounds().await),
            ("vote_reminders", self.sweep_vote_reminders().await),
            ("reputation", self.sweep_reputation().await),
            ("retention", self.sweep_retention().await),
        ];

        for (name, result) in sweeps {
            match result {
                Ok(partial) => report.merge(partial),
                Err(e) => {
                    tracing::error!(sweep = name, error = %e, "Sweep failed");
                    report.failures.push(format!("{name}: {e}"));
                }
            }
        }

        tracing::info!(
            actions = report.actions_performed,
            failures = report.failures.len(),
            "Proactive pass complete"
        );
        report
    }

    /// Retry messages still unprocessed after `stale_after`.
    pub async fn sweep_stale_messages(&self) -> EngineResult<ProactiveReport> {
        let cutoff = Utc::now() - self.sweeps.stale_after();
        let stale = self
            .io(
                "list_stale_messages",
                self.store.list_stale_messages(cutoff, self.sweeps.stale_batch),
            )
            .await?;

        let mut report = ProactiveReport::default();
        for message in stale {
            let outcome = match self.process_message(&message.message_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(message_id = %message.message_id, error = %e, "Stale message retry failed");
                    report
                        .failures
                        .push(format!("message {}: {e}", message.message_id));
                    continue;
                }
            };
            if outcome.replayed || (outcome.status == MessageStatus::Failed && outcome.retryable) {
                continue;
            }
            report.push(format!(
                "Processed stale message {} ({:?})",
                message.message_id, outcome.status
            ));
        }
        Ok(report)
    }

    /// Retry proposals still pending after `stale_after`.
    pub async fn sweep_stale_proposals(&self) -> EngineResult<ProactiveReport> {
        let cutoff = Utc::now() - self.sweeps.stale_after();
        let stale = self
            .io(
                "list_stale_proposals",
                self.store.list_stale_proposals(cutoff, self.sweeps.stale_batch),
            )
            .await?;

        let mut report = ProactiveReport::default();
        for proposal in stale {
            let outcome = match self.process_proposal(&proposal.proposal_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(proposal_id = %proposal.proposal_id, error = %e, "Stale proposal retry failed");
                    report
                        .failures
                        .push(format!("proposal {}: {e}", proposal.proposal_id));
                    continue;
                }
            };
            if outcome.replayed
                || matches!(
                    outcome.disposition,
                    ProposalDisposition::Failed | ProposalDisposition::InProgress
                )
            {
                continue;
            }
            report.push(format!(
                "Processed stale proposal {} ({:?})",
                proposal.proposal_id, outcome.disposition
            ));
        }
        Ok(report)
    }

    /// Close rounds whose deadline has passed.
    pub async fn sweep_expired_rounds(&self) -> EngineResult<ProactiveReport> {
        let now = Utc::now();
        let expired = self
            .io(
                "list_open_rounds",
                self.store
                    .list_open_rounds(Some(now), self.sweeps.round_close_batch),
            )
            .await?;

        let mut report = ProactiveReport::default();
        for round in expired {
            let proposal_status = match self.evaluate_round(&round, now).await {
                Ok((_, _, status)) => status,
                Err(e) => {
                    tracing::warn!(round_id = %round.round_id, error = %e, "Failed to close expired round");
                    report.failures.push(format!("round {}: {e}", round.round_id));
                    continue;
                }
            };
            report.push(format!(
                "Closed round {} for proposal {} ({})",
                round.round_id, round.proposal_id, proposal_status
            ));
        }
        Ok(report)
    }

    /// Remind eligible voters who have not voted on rounds closing soon.
    /// At most one reminder per voter per round.
    pub async fn sweep_vote_reminders(&self) -> EngineResult<ProactiveReport> {
        let now = Utc::now();
        let closing = self
            .io(
                "list_open_rounds",
                self.store.list_open_rounds(
                    Some(now + self.sweeps.reminder_window()),
                    self.sweeps.reminder_batch,
                ),
            )
            .await?;

        let mut report = ProactiveReport::default();
        for round in closing {
            if round.deadline_passed(now) {
                continue;
            }
            let mut sent = 0usize;
            for voter in &round.eligible_voters {
                let voted = self
                    .io("has_voted", self.store.has_voted(voter, &round.proposal_id))
                    .await?;
                if voted {
                    continue;
                }
                let reminder = Message::system(
                    MessageId::voting_reminder(&round.round_id, voter),
                    voter.clone(),
                    VOTING_REMINDER,
                    json!({
                        "proposal_id": round.proposal_id,
                        "round_id": round.round_id,
                        "voting_deadline": round.voting_deadline,
                    }),
                    Some(round.voting_deadline),
                );
                match self.io("insert_message", self.store.insert_message(reminder)).await {
                    Ok(()) => {
                        sent += 1;
                        self.emit(EngineEvent::VotingReminder {
                            agent_id: voter.clone(),
                            proposal_id: round.proposal_id.clone(),
                            round_id: round.round_id.clone(),
                            deadline: round.voting_deadline,
                        });
                    }
                    Err(EngineError::Store(StorageError::Conflict(_))) => {}
                    Err(e) => return Err(e),
                }
            }
            if sent > 0 {
                report.push(format!(
                    "Sent {sent} voting reminders for proposal {}",
                    round.proposal_id
                ));
            }
        }
        Ok(report)
    }

    /// Refresh the stalest reputation snapshots.
    pub async fn sweep_reputation(&self) -> EngineResult<ProactiveReport> {
        let agents = self
            .io(
                "agents_due_for_reputation",
                self.store
                    .agents_due_for_reputation(self.sweeps.reputation_batch),
            )
            .await?;

        let mut report = ProactiveReport::default();
        let mut updated = 0usize;
        for agent in &agents {
            match self.refresh_reputation(agent).await {
                Ok(_) => updated += 1,
                Err(e) => {
                    tracing::warn!(agent_id = %agent.agent_id, error = %e, "Reputation refresh failed");
                    report
                        .failures
                        .push(format!("agent {}: {e}", agent.agent_id));
                }
            }
        }
        if updated > 0 {
            report.push(format!("Updated reputation for {updated} agents"));
        }
        Ok(report)
    }

    /// Delete non-durable activity older than the retention window.
    pub async fn sweep_retention(&self) -> EngineResult<ProactiveReport> {
        let cutoff = Utc::now() - self.sweeps.retention_window();
        let removed = self
            .io(
                "prune_activities",
                self.store
                    .prune_activities(cutoff, &self.sweeps.durable_activity_types),
            )
            .await?;

        let mut report = ProactiveReport::default();
        if removed > 0 {
            report.push(format!("Pruned {removed} expired activity records"));
        }
        Ok(report)
    }
}
