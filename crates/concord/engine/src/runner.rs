//! Agent runners.
//!
//! The pool listens to [`EngineEvent`]s. A task assignment asks the oracle
//! whether the agent should answer the message; a voting invitation or
//! reminder asks how it votes. Oracle failures are logged and produce no
//! action: no reply, no vote.

use crate::config::RunnerConfig;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, OracleError};
use crate::events::EngineEvent;
use crate::oracle::{
    decide, Decision, DecisionKind, DecisionOracle, OracleRequest, ResponsePayload, VotePayload,
};
use chrono::{DateTime, Utc};
use concord_types::{
    Agent, AgentId, Message, MessageId, Proposal, ProposalId, TaskId, TaskStatus, VoteChoice,
    VoteReceipt,
};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;

/// What a runner did with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerAction {
    Responded(MessageId),
    Declined,
    Voted(VoteReceipt),
    /// The oracle failed or returned something unusable.
    NoDecision(String),
    Skipped(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct RememberedMessage {
    pub message_id: MessageId,
    pub sender_id: AgentId,
    pub message_type: String,
    pub content: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RememberedVote {
    pub proposal_id: ProposalId,
    pub title: String,
    pub choice: VoteChoice,
    pub at: DateTime<Utc>,
}

/// Bounded recent history, oldest evicted first.
#[derive(Debug)]
pub struct AgentMemory {
    capacity: usize,
    messages: VecDeque<RememberedMessage>,
    votes: VecDeque<RememberedVote>,
}

impl AgentMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: VecDeque::new(),
            votes: VecDeque::new(),
        }
    }

    pub fn remember_message(&mut self, message: &Message) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(RememberedMessage {
            message_id: message.message_id.clone(),
            sender_id: message.sender_id.clone(),
            message_type: message.message_type.clone(),
            content: message.content.clone(),
            at: Utc::now(),
        });
    }

    pub fn remember_vote(&mut self, proposal: &Proposal, choice: VoteChoice) {
        if self.votes.len() == self.capacity {
            self.votes.pop_front();
        }
        self.votes.push_back(RememberedVote {
            proposal_id: proposal.proposal_id.clone(),
            title: proposal.title.clone(),
            choice,
            at: Utc::now(),
        });
    }

    pub fn recent_messages(&self, n: usize) -> Vec<&RememberedMessage> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).collect()
    }

    pub fn recent_votes(&self, n: usize) -> Vec<&RememberedVote> {
        let skip = self.votes.len().saturating_sub(n);
        self.votes.iter().skip(skip).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len() + self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-agent state.
#[derive(Debug)]
pub struct AgentRunner {
    agent_id: AgentId,
    memory: Mutex<AgentMemory>,
}

impl AgentRunner {
    pub fn new(agent_id: AgentId, capacity: usize) -> Self {
        Self {
            agent_id,
            memory: Mutex::new(AgentMemory::new(capacity)),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn memory(&self) -> &Mutex<AgentMemory> {
        &self.memory
    }

    async fn context(&self, config: &RunnerConfig) -> serde_json::Value {
        let memory = self.memory.lock().await;
        json!({
            "recent_messages": memory.recent_messages(config.context_messages),
            "recent_votes": memory.recent_votes(config.context_votes),
        })
    }
}

fn system_prompt(agent: &Agent, task: &str) -> String {
    let capabilities: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
    format!(
        "You are {name}, an autonomous agent with capabilities [{caps}]. {task} \
         Reply with a single JSON object: \
         {{\"should_act\": bool, \"payload\": object, \"reasoning\": string}}.",
        name = agent.name,
        caps = capabilities.join(", "),
    )
}

pub struct AgentRunnerPool {
    engine: Arc<Engine>,
    oracle: Arc<dyn DecisionOracle>,
    config: RunnerConfig,
    runners: RwLock<HashMap<AgentId, Arc<AgentRunner>>>,
    permits: Semaphore,
}

impl AgentRunnerPool {
    pub fn new(engine: Arc<Engine>, oracle: Arc<dyn DecisionOracle>, config: RunnerConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent_decisions.max(1));
        Self {
            engine,
            oracle,
            config,
            runners: RwLock::new(HashMap::new()),
            permits,
        }
    }

    /// Runner for `agent_id`, created on first use.
    pub async fn runner(&self, agent_id: &AgentId) -> Arc<AgentRunner> {
        if let Some(runner) = self.runners.read().await.get(agent_id) {
            return runner.clone();
        }
        self.runners
            .write()
            .await
            .entry(agent_id.clone())
            .or_insert_with(|| {
                Arc::new(AgentRunner::new(
                    agent_id.clone(),
                    self.config.memory_capacity,
                ))
            })
            .clone()
    }

    /// Consume events until shutdown. Each event is handled on its own task.
    pub fn start(
        self: Arc<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(oracle = self.oracle.name(), "Agent runner pool started");
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            let pool = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = pool.handle(event).await {
                                    tracing::warn!(error = %e, "Runner event failed");
                                }
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Tasks stay in the store; votes missed here get a reminder.
                            tracing::warn!(skipped, "Runner pool lagged behind engine events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Agent runner pool stopped");
        })
    }

    pub async fn handle(&self, event: EngineEvent) -> EngineResult<RunnerAction> {
        match event {
            EngineEvent::TaskAssigned {
                task_id,
                agent_id,
                message_id,
                ..
            } => self.handle_task(&task_id, &agent_id, &message_id).await,
            EngineEvent::VotingInvitation {
                agent_id,
                proposal_id,
                ..
            }
            | EngineEvent::VotingReminder {
                agent_id,
                proposal_id,
                ..
            } => self.handle_vote(&agent_id, &proposal_id).await,
            EngineEvent::RoundClosed { .. } => Ok(RunnerAction::Skipped("round closed")),
        }
    }

    async fn handle_task(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        message_id: &MessageId,
    ) -> EngineResult<RunnerAction> {
        let store = &self.engine.store;
        let message = self
            .engine
            .io("get_message", store.get_message(message_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("message {message_id}")))?;
        let agent = self.engine.get_agent(agent_id).await?;
        let runner = self.runner(agent_id).await;

        let request = OracleRequest {
            kind: DecisionKind::MessageResponse,
            system_prompt: system_prompt(
                &agent,
                "Decide whether to respond to the incoming message.",
            ),
            user_prompt: json!({
                "message": {
                    "message_id": message.message_id,
                    "sender_id": message.sender_id,
                    "message_type": message.message_type,
                    "content": message.content,
                    "requires_response": message.requires_response,
                    "response_deadline": message.response_deadline,
                },
                "context": runner.context(&self.config).await,
            })
            .to_string(),
        };
        runner.memory.lock().await.remember_message(&message);

        let action = match self.consult(agent_id, &request).await {
            Ok(decision) if decision.should_act => {
                match decision.payload_as::<ResponsePayload>() {
                    Ok(reply) => {
                        let response = Message::new(agent_id.clone(), reply.message_type, reply.content)
                            .with_recipients(reply.recipient_ids);
                        let id = self.engine.submit_message(response).await?;
                        tracing::info!(agent_id = %agent_id, in_reply_to = %message_id, response_id = %id, "Agent responded");
                        RunnerAction::Responded(id)
                    }
                    Err(e) => self.no_decision(agent_id, e),
                }
            }
            Ok(_) => RunnerAction::Declined,
            Err(e) => self.no_decision(agent_id, e),
        };

        let status = match action {
            RunnerAction::NoDecision(_) => TaskStatus::Failed,
            _ => TaskStatus::Completed,
        };
        let now = Utc::now();
        self.engine
            .io(
                "update_task_status",
                store.update_task_status(task_id, status, now),
            )
            .await?;
        self.engine
            .io("touch_agent", store.touch_agent(agent_id, now, 1))
            .await?;
        Ok(action)
    }

    async fn handle_vote(
        &self,
        agent_id: &AgentId,
        proposal_id: &ProposalId,
    ) -> EngineResult<RunnerAction> {
        let store = &self.engine.store;
        let voted = self
            .engine
            .io("has_voted", store.has_voted(agent_id, proposal_id))
            .await?;
        if voted {
            return Ok(RunnerAction::Skipped("already voted"));
        }
        let proposal = self
            .engine
            .io("get_proposal", store.get_proposal(proposal_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("proposal {proposal_id}")))?;
        if proposal.status.is_terminal() {
            return Ok(RunnerAction::Skipped("proposal decided"));
        }
        let agent = self.engine.get_agent(agent_id).await?;
        let runner = self.runner(agent_id).await;

        let request = OracleRequest {
            kind: DecisionKind::ProposalVote,
            system_prompt: system_prompt(
                &agent,
                "Vote on the proposal. Payload: {\"vote\": \"approve\" | \"reject\" | \"abstain\"}.",
            ),
            user_prompt: json!({
                "proposal": {
                    "proposal_id": proposal.proposal_id,
                    "proposer_id": proposal.proposer_id,
                    "title": proposal.title,
                    "description": proposal.description,
                    "proposal_data": proposal.proposal_data,
                },
                "context": runner.context(&self.config).await,
            })
            .to_string(),
        };

        let decision = match self.consult(agent_id, &request).await {
            Ok(decision) if decision.should_act => decision,
            Ok(_) => return Ok(RunnerAction::Declined),
            Err(e) => return Ok(self.no_decision(agent_id, e)),
        };
        let choice = match decision.payload_as::<VotePayload>() {
            Ok(payload) => payload.vote,
            Err(e) => return Ok(self.no_decision(agent_id, e)),
        };

        let receipt = self
            .engine
            .cast_vote(agent_id, proposal_id, choice, decision.reasoning)
            .await?;
        if receipt.accepted {
            runner.memory.lock().await.remember_vote(&proposal, choice);
            self.engine
                .io("touch_agent", store.touch_agent(agent_id, Utc::now(), 0))
                .await?;
        }
        Ok(RunnerAction::Voted(receipt))
    }

    async fn consult(
        &self,
        agent_id: &AgentId,
        request: &OracleRequest,
    ) -> Result<Decision, OracleError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| OracleError::Unavailable("runner pool closed".to_string()))?;
        tracing::debug!(agent_id = %agent_id, kind = ?request.kind, "Consulting oracle");
        decide(self.oracle.as_ref(), request, self.config.oracle_timeout()).await
    }

    fn no_decision(&self, agent_id: &AgentId, error: OracleError) -> RunnerAction {
        tracing::warn!(agent_id = %agent_id, error = %error, "Oracle gave no usable decision");
        RunnerAction::NoDecision(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_evicts_oldest() {
        let mut memory = AgentMemory::new(3);
        for i in 0..5 {
            let message = Message::new("s", "note", json!({ "n": i })).with_id(format!("m-{i}"));
            memory.remember_message(&message);
        }
        let recent = memory.recent_messages(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message_id.as_str(), "m-2");
        assert_eq!(recent[2].message_id.as_str(), "m-4");

        let last_two = memory.recent_messages(2);
        assert_eq!(last_two[0].message_id.as_str(), "m-3");
    }

    #[test]
    fn votes_are_remembered_separately() {
        let mut memory = AgentMemory::new(100);
        let proposal = Proposal::new("p", "Adopt policy").with_description("details");
        memory.remember_vote(&proposal, VoteChoice::Approve);
        assert_eq!(memory.recent_votes(5).len(), 1);
        assert!(memory.recent_messages(5).is_empty());
        assert_eq!(memory.len(), 1);
    }
}
