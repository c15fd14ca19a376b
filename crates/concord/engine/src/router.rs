//! Message routing.
//!
//! ```text
//! received -> identity_checked -> reputation_checked -> routed -> processed
//!                    |                    |
//!                 FAILED               FILTERED
//! ```
//!
//! The message lease is the only serialization point: whichever path
//! (change feed or stale sweep) claims the message first processes it.

use crate::config::{EngineConfig, PriorityBands};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use chrono::Utc;
use concord_storage::{AgentFilter, StorageError};
use concord_types::{
    ActivityId, ActivityRecord, Agent, AgentId, ClaimOutcome, Message, MessageId, MessageOutcome,
    MessageStatus, Priority, TaskRecord,
};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const MESSAGE_PROCESSED: &str = "message_processed";

/// Priority from reputation bands. `urgent` messages keep urgent priority
/// only when the sender clears `urgent_min`; otherwise they cap at high.
pub fn assign_priority(score: u32, urgent: bool, bands: &PriorityBands) -> Priority {
    if urgent {
        return if score >= bands.urgent_min {
            Priority::Urgent
        } else {
            Priority::High
        };
    }
    if score >= bands.high {
        Priority::High
    } else if score >= bands.medium {
        Priority::Medium
    } else if score < bands.low_below {
        Priority::Low
    } else {
        Priority::Normal
    }
}

/// Pick target agents from `candidates`, which must already be active,
/// identity-configured and ordered most recently active first.
///
/// Agents holding any of the required capabilities are preferred (up to
/// `max_targets`). With no requirement or no match the most recently
/// active `fallback_targets` agents are used. The sender is never a target.
pub fn select_targets(
    candidates: &[Agent],
    sender: &AgentId,
    required: &[String],
    config: &EngineConfig,
) -> Vec<AgentId> {
    let others = candidates.iter().filter(|a| &a.agent_id != sender);

    if !required.is_empty() {
        let matched: Vec<AgentId> = others
            .clone()
            .filter(|a| required.iter().any(|cap| a.has_capability(cap)))
            .take(config.max_targets)
            .map(|a| a.agent_id.clone())
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }

    others
        .take(config.fallback_targets)
        .map(|a| a.agent_id.clone())
        .collect()
}

impl Engine {
    /// Route one message. Re-processing a processed message returns the
    /// stored outcome flagged as a replay and writes nothing.
    pub async fn process_message(&self, message_id: &MessageId) -> EngineResult<MessageOutcome> {
        let claim = self
            .io(
                "claim_message",
                self.store.claim_message(
                    message_id,
                    &self.worker_id,
                    Utc::now(),
                    self.config.claim_ttl(),
                ),
            )
            .await;

        match claim {
            Ok(ClaimOutcome::Acquired) => {}
            Ok(ClaimOutcome::Finished) => return self.replay_message(message_id).await,
            Ok(ClaimOutcome::Contended { owner, .. }) => {
                tracing::debug!(message_id = %message_id, owner = %owner, "Message owned by another worker");
                return Ok(MessageOutcome::new(message_id.clone(), MessageStatus::Failed)
                    .with_reason(format!("message is being processed by {owner}"))
                    .retryable());
            }
            Err(EngineError::Store(StorageError::NotFound(_))) => {
                return Err(EngineError::NotFound(format!("message {message_id}")));
            }
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = %e, "Could not claim message");
                return Ok(failure(message_id, &e));
            }
        }

        let outcome = match self.route_claimed(message_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(message_id = %message_id, error = %e, "Message processing failed");
                failure(message_id, &e)
            }
        };

        let finalized = self
            .io(
                "finalize_message",
                self.store.finalize_message(
                    message_id,
                    &self.worker_id,
                    outcome.clone(),
                    Utc::now(),
                ),
            )
            .await;

        match finalized {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(message_id = %message_id, "Lease lost before message outcome was stored");
            }
            Err(e) => {
                // The lease lapses on its own and the stale sweep retries.
                tracing::warn!(message_id = %message_id, error = %e, "Failed to store message outcome");
                return Ok(failure(message_id, &e));
            }
        }

        tracing::info!(
            message_id = %message_id,
            status = ?outcome.status,
            score = ?outcome.reputation_score,
            targets = outcome.target_agents.len(),
            "Message processed"
        );
        Ok(outcome)
    }

    async fn replay_message(&self, message_id: &MessageId) -> EngineResult<MessageOutcome> {
        let message = self
            .io("get_message", self.store.get_message(message_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("message {message_id}")))?;
        let outcome = message
            .outcome
            .unwrap_or_else(|| MessageOutcome::new(message_id.clone(), MessageStatus::Processed));
        Ok(outcome.replayed())
    }

    async fn route_claimed(&self, message_id: &MessageId) -> EngineResult<MessageOutcome> {
        let message = self
            .io("get_message", self.store.get_message(message_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("message {message_id}")))?;

        let sender = match self
            .io("get_agent", self.store.get_agent(&message.sender_id))
            .await?
        {
            Some(agent) => agent,
            None => {
                return Ok(MessageOutcome::new(message_id.clone(), MessageStatus::Failed)
                    .with_reason(format!("sender {} is not registered", message.sender_id)));
            }
        };

        if let Err(e) = self.identity.verify(&sender) {
            tracing::info!(message_id = %message_id, sender = %sender.agent_id, error = %e, "Sender failed identity verification");
            return Ok(MessageOutcome::new(message_id.clone(), MessageStatus::Failed)
                .with_reason(e.to_string()));
        }

        let score = self.score_agent(&sender).await?;
        if score < self.config.min_sender_reputation {
            let reason = EngineError::ReputationTooLow {
                score,
                threshold: self.config.min_sender_reputation,
            };
            return Ok(MessageOutcome::new(message_id.clone(), MessageStatus::Filtered)
                .with_score(score)
                .with_reason(reason.to_string()));
        }

        let priority = assign_priority(score, message.is_urgent(), &self.config.priority);
        let targets = self.resolve_targets(&message).await?;
        let recorded = self.dispatch_tasks(&message, &targets, score, priority).await;

        if !targets.is_empty() && recorded.is_empty() {
            return Ok(MessageOutcome::new(message_id.clone(), MessageStatus::Failed)
                .with_score(score)
                .with_reason("no task could be recorded")
                .retryable());
        }

        let activity = ActivityRecord::confirmed(
            ActivityId::message_processed(message_id),
            sender.agent_id.clone(),
            MESSAGE_PROCESSED,
            json!({
                "message_id": message_id,
                "priority": priority,
                "target_agents": recorded,
            }),
        );
        self.record_activity(activity).await?;

        let mut outcome = MessageOutcome::new(message_id.clone(), MessageStatus::Processed)
            .with_score(score);
        outcome.priority = Some(priority);
        outcome.tasks_created = recorded.len();
        outcome.target_agents = recorded;
        Ok(outcome)
    }

    /// Explicit recipients win when they are registered, active and
    /// identity-verified; otherwise the router selects by capability.
    async fn resolve_targets(&self, message: &Message) -> EngineResult<Vec<AgentId>> {
        if !message.recipient_ids.is_empty() {
            let mut targets = Vec::new();
            for recipient in &message.recipient_ids {
                let agent = self.io("get_agent", self.store.get_agent(recipient)).await?;
                match agent {
                    Some(agent) if agent.is_active() && self.identity.verify(&agent).is_ok() => {
                        targets.push(agent.agent_id)
                    }
                    _ => {
                        tracing::debug!(message_id = %message.message_id, recipient = %recipient, "Skipping unknown, inactive or unverified recipient");
                    }
                }
            }
            return Ok(targets);
        }

        let mut candidates = self
            .io("list_agents", self.store.list_agents(AgentFilter::routable()))
            .await?;
        // The filter only checks that a proof is present.
        candidates.retain(|agent| self.identity.verify(agent).is_ok());
        Ok(select_targets(
            &candidates,
            &message.sender_id,
            &message.required_capabilities(),
            &self.config,
        ))
    }

    /// Insert one task per target with bounded concurrency. Returns the
    /// targets whose task is recorded, including ones recorded by an
    /// earlier attempt.
    async fn dispatch_tasks(
        &self,
        message: &Message,
        targets: &[AgentId],
        score: u32,
        priority: Priority,
    ) -> Vec<AgentId> {
        let semaphore = Arc::new(Semaphore::new(self.config.dispatch_concurrency.max(1)));

        let inserts = targets.iter().cloned().map(|agent_id| {
            let semaphore = semaphore.clone();
            let task = TaskRecord::started(
                agent_id.clone(),
                message.message_id.clone(),
                score,
                priority,
            );
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                let task_id = task.task_id.clone();
                match self.io("insert_task", self.store.insert_task(task)).await {
                    Ok(()) => {}
                    Err(EngineError::Store(StorageError::Conflict(_))) => {}
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "Task insert failed");
                        return None;
                    }
                }
                self.emit(EngineEvent::TaskAssigned {
                    task_id,
                    agent_id: agent_id.clone(),
                    message_id: message.message_id.clone(),
                    priority,
                });
                Some(agent_id)
            }
        });

        join_all(inserts).await.into_iter().flatten().collect()
    }

    /// Insert an activity record; an existing record with the same id
    /// counts as done.
    pub(crate) async fn record_activity(&self, record: ActivityRecord) -> EngineResult<()> {
        match self.io("record_activity", self.store.record_activity(record)).await {
            Ok(()) | Err(EngineError::Store(StorageError::Conflict(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn failure(message_id: &MessageId, error: &EngineError) -> MessageOutcome {
    let outcome =
        MessageOutcome::new(message_id.clone(), MessageStatus::Failed).with_reason(error.to_string());
    if error.is_transient() {
        outcome.retryable()
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bands() -> PriorityBands {
        PriorityBands::default()
    }

    #[test]
    fn priority_bands() {
        assert_eq!(assign_priority(850, false, &bands()), Priority::High);
        assert_eq!(assign_priority(800, false, &bands()), Priority::High);
        assert_eq!(assign_priority(650, false, &bands()), Priority::Medium);
        assert_eq!(assign_priority(649, false, &bands()), Priority::Normal);
        assert_eq!(assign_priority(500, false, &bands()), Priority::Normal);
        assert_eq!(assign_priority(499, false, &bands()), Priority::Low);
    }

    #[test]
    fn urgent_requires_standing() {
        assert_eq!(assign_priority(600, true, &bands()), Priority::Urgent);
        assert_eq!(assign_priority(599, true, &bands()), Priority::High);
        assert_eq!(assign_priority(420, true, &bands()), Priority::High);
    }

    fn agent(id: &str, caps: &[&str], minutes_ago: i64) -> Agent {
        let mut agent = Agent::new(id, id).with_capabilities(caps.iter().copied());
        agent.last_active_at = Some(Utc::now() - Duration::minutes(minutes_ago));
        agent
    }

    #[test]
    fn capability_match_limited_to_max_targets() {
        let config = EngineConfig {
            max_targets: 2,
            ..EngineConfig::default()
        };
        let candidates = vec![
            agent("a", &["design"], 1),
            agent("b", &["audit", "legal"], 2),
            agent("c", &["legal"], 3),
            agent("d", &["audit"], 4),
        ];
        let required = vec!["audit".to_string(), "legal".to_string()];
        let targets = select_targets(&candidates, &AgentId::new("x"), &required, &config);
        assert_eq!(targets, vec![AgentId::new("b"), AgentId::new("c")]);
    }

    #[test]
    fn partial_capability_overlap_matches() {
        let config = EngineConfig::default();
        let candidates = vec![
            agent("a", &["audit"], 1),
            agent("b", &["legal"], 2),
            agent("c", &["design"], 3),
            agent("d", &["ops"], 4),
        ];
        let required = vec!["audit".to_string(), "legal".to_string()];
        let targets = select_targets(&candidates, &AgentId::new("x"), &required, &config);
        assert_eq!(targets, vec![AgentId::new("a"), AgentId::new("b")]);
    }

    #[test]
    fn no_match_falls_back_to_recent_agents() {
        let config = EngineConfig::default();
        let candidates = vec![
            agent("s", &[], 0),
            agent("a", &[], 1),
            agent("b", &[], 2),
            agent("c", &[], 3),
            agent("d", &[], 4),
        ];
        let required = vec!["quantum".to_string()];
        let targets = select_targets(&candidates, &AgentId::new("s"), &required, &config);
        assert_eq!(
            targets,
            vec![AgentId::new("a"), AgentId::new("b"), AgentId::new("c")]
        );
    }

    #[test]
    fn sender_is_never_targeted() {
        let config = EngineConfig::default();
        let candidates = vec![agent("s", &["audit"], 0)];
        let required = vec!["audit".to_string()];
        assert!(select_targets(&candidates, &AgentId::new("s"), &required, &config).is_empty());
    }
}
