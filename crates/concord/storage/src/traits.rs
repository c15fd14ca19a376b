use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use concord_types::{
    ActivityRecord, Agent, AgentId, ChangeNotification, ClaimOutcome, ConsensusRound, Message,
    MessageId, MessageOutcome, Proposal, ProposalId, ProposalOutcome, ProposalStatus,
    ProposalTransition, RoundId, RoundOutcome, TaskId, TaskRecord, TaskStatus, Vote,
};
use tokio::sync::broadcast;

/// Agent listing filter. Results are ordered most recently active first.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentFilter {
    pub active_only: bool,
    pub identity_only: bool,
    pub limit: Option<usize>,
}

impl AgentFilter {
    /// Active agents with an identity proof configured.
    pub fn routable() -> Self {
        Self {
            active_only: true,
            identity_only: true,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Storage interface for registered agents.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn upsert_agent(&self, agent: Agent) -> StorageResult<()>;
    async fn get_agent(&self, agent_id: &AgentId) -> StorageResult<Option<Agent>>;
    async fn list_agents(&self, filter: AgentFilter) -> StorageResult<Vec<Agent>>;

    /// Active agents whose reputation was refreshed longest ago, never-scored first.
    async fn agents_due_for_reputation(&self, limit: usize) -> StorageResult<Vec<Agent>>;

    async fn set_reputation(
        &self,
        agent_id: &AgentId,
        score: u32,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Bump `last_active_at` and add to `messages_processed`.
    async fn touch_agent(
        &self,
        agent_id: &AgentId,
        at: DateTime<Utc>,
        messages_processed: u64,
    ) -> StorageResult<()>;
}

/// Storage interface for inter-agent messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fails with `Conflict` if the id exists.
    async fn insert_message(&self, message: Message) -> StorageResult<()>;
    async fn get_message(&self, message_id: &MessageId) -> StorageResult<Option<Message>>;

    /// Atomically check `processed` and take the processing lease.
    async fn claim_message(
        &self,
        message_id: &MessageId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<ClaimOutcome>;

    /// Store the outcome of a processing attempt. Returns false if the
    /// message was already processed or the lease moved to another owner.
    async fn finalize_message(
        &self,
        message_id: &MessageId,
        owner: &str,
        outcome: MessageOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Unprocessed agent messages created before `created_before`, oldest first.
    async fn list_stale_messages(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Message>>;
}

/// Storage interface for proposals.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn insert_proposal(&self, proposal: Proposal) -> StorageResult<()>;
    async fn get_proposal(&self, proposal_id: &ProposalId) -> StorageResult<Option<Proposal>>;

    /// Take the processing lease on a pending proposal.
    async fn claim_proposal(
        &self,
        proposal_id: &ProposalId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<ClaimOutcome>;

    async fn release_proposal(
        &self,
        proposal_id: &ProposalId,
        owner: &str,
        outcome: Option<ProposalOutcome>,
    ) -> StorageResult<bool>;

    /// Compare-and-set status change; false when the status is not one of `expected`.
    async fn transition_proposal(
        &self,
        proposal_id: &ProposalId,
        expected: &[ProposalStatus],
        change: ProposalTransition,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Pending proposals created before `created_before`, oldest first.
    async fn list_stale_proposals(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Proposal>>;
}

/// Storage interface for consensus rounds.
#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Fails with `Conflict` if the proposal already has an open round.
    async fn insert_round(&self, round: ConsensusRound) -> StorageResult<()>;
    async fn get_round(&self, round_id: &RoundId) -> StorageResult<Option<ConsensusRound>>;
    async fn open_round_for_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> StorageResult<Option<ConsensusRound>>;

    /// Open rounds, soonest deadline first. `deadline_before` narrows to
    /// rounds ending before that instant.
    async fn list_open_rounds(
        &self,
        deadline_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<ConsensusRound>>;

    /// Compare-and-set close; false when the round was already closed.
    async fn close_round(
        &self,
        round_id: &RoundId,
        outcome: RoundOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;
}

/// Storage interface for votes. One vote per (agent, proposal).
#[async_trait]
pub trait VoteStore: Send + Sync {
    /// Fails with `Conflict` if the agent already voted on the proposal.
    async fn insert_vote(&self, vote: Vote) -> StorageResult<()>;
    async fn list_votes(&self, round_id: &RoundId) -> StorageResult<Vec<Vote>>;
    async fn has_voted(&self, agent_id: &AgentId, proposal_id: &ProposalId) -> StorageResult<bool>;
}

/// Storage interface for activity records.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Fails with `Conflict` if the activity id exists.
    async fn record_activity(&self, record: ActivityRecord) -> StorageResult<()>;
    async fn count_confirmed_activities(&self, agent_id: &AgentId) -> StorageResult<u64>;
    async fn list_activities(&self, agent_id: &AgentId) -> StorageResult<Vec<ActivityRecord>>;

    /// Delete non-durable records created before `created_before` whose
    /// type is not in `keep_types`. Returns the number removed.
    async fn prune_activities(
        &self,
        created_before: DateTime<Utc>,
        keep_types: &[String],
    ) -> StorageResult<u64>;
}

/// Storage interface for task assignments.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fails with `Conflict` if the task id exists.
    async fn insert_task(&self, task: TaskRecord) -> StorageResult<()>;
    async fn get_task(&self, task_id: &TaskId) -> StorageResult<Option<TaskRecord>>;
    async fn list_tasks_for_message(&self, message_id: &MessageId)
        -> StorageResult<Vec<TaskRecord>>;
    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;
}

/// Connectivity probe.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> StorageResult<()>;
}

/// Insert notifications for unprocessed messages and pending proposals.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;
}

/// Unified storage bundle used by the engine.
pub trait ConcordStore:
    AgentStore
    + MessageStore
    + ProposalStore
    + RoundStore
    + VoteStore
    + ActivityStore
    + TaskStore
    + StoreHealth
    + ChangeFeed
    + Send
    + Sync
{
}

impl<T> ConcordStore for T where
    T: AgentStore
        + MessageStore
        + ProposalStore
        + RoundStore
        + VoteStore
        + ActivityStore
        + TaskStore
        + StoreHealth
        + ChangeFeed
        + Send
        + Sync
{
}
