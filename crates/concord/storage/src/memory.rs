//! In-memory reference implementation of the Concord storage traits.
//!
//! Deterministic and test-friendly. Every compare-and-set runs under a single
//! write lock so it has the same atomicity as the conditional updates of the
//! Postgres adapter.

use crate::traits::{
    ActivityStore, AgentFilter, AgentStore, ChangeFeed, MessageStore, ProposalStore, RoundStore,
    StoreHealth, TaskStore, VoteStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use concord_types::{
    ActivityId, ActivityRecord, ActivityStatus, Agent, AgentId, ChangeNotification, ClaimOutcome,
    ConsensusRound, Message, MessageId, MessageOutcome, Proposal, ProposalId, ProposalOutcome,
    ProposalStatus, ProposalTransition, RoundId, RoundOutcome, TaskId, TaskRecord, TaskStatus,
    Vote,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const CHANGE_FEED_CAPACITY: usize = 1024;

/// In-memory Concord storage adapter.
pub struct InMemoryConcordStore {
    agents: RwLock<HashMap<AgentId, Agent>>,
    messages: RwLock<HashMap<MessageId, Message>>,
    proposals: RwLock<HashMap<ProposalId, Proposal>>,
    rounds: RwLock<HashMap<RoundId, ConsensusRound>>,
    votes: RwLock<HashMap<(ProposalId, AgentId), Vote>>,
    activities: RwLock<HashMap<ActivityId, ActivityRecord>>,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    changes: broadcast::Sender<ChangeNotification>,
    offline: AtomicBool,
}

impl Default for InMemoryConcordStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            agents: RwLock::default(),
            messages: RwLock::default(),
            proposals: RwLock::default(),
            rounds: RwLock::default(),
            votes: RwLock::default(),
            activities: RwLock::default(),
            tasks: RwLock::default(),
            changes,
            offline: AtomicBool::new(false),
        }
    }
}

impl InMemoryConcordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while offline every call fails with a backend error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    fn notify(&self, change: ChangeNotification) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

fn read<'a, T>(lock: &'a RwLock<T>, name: &str) -> StorageResult<RwLockReadGuard<'a, T>> {
    lock.read()
        .map_err(|_| StorageError::Backend(format!("{name} lock poisoned")))
}

fn write<'a, T>(lock: &'a RwLock<T>, name: &str) -> StorageResult<RwLockWriteGuard<'a, T>> {
    lock.write()
        .map_err(|_| StorageError::Backend(format!("{name} lock poisoned")))
}

#[async_trait]
impl AgentStore for InMemoryConcordStore {
    async fn upsert_agent(&self, agent: Agent) -> StorageResult<()> {
        self.check_online()?;
        write(&self.agents, "agents")?.insert(agent.agent_id.clone(), agent);
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> StorageResult<Option<Agent>> {
        self.check_online()?;
        Ok(read(&self.agents, "agents")?.get(agent_id).cloned())
    }

    async fn list_agents(&self, filter: AgentFilter) -> StorageResult<Vec<Agent>> {
        self.check_online()?;
        let guard = read(&self.agents, "agents")?;
        let mut agents: Vec<Agent> = guard
            .values()
            .filter(|a| !filter.active_only || a.is_active())
            .filter(|a| !filter.identity_only || a.has_identity())
            .cloned()
            .collect();
        agents.sort_by(|a, b| {
            b.recency()
                .cmp(&a.recency())
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        if let Some(limit) = filter.limit {
            agents.truncate(limit);
        }
        Ok(agents)
    }

    async fn agents_due_for_reputation(&self, limit: usize) -> StorageResult<Vec<Agent>> {
        self.check_online()?;
        let guard = read(&self.agents, "agents")?;
        let mut agents: Vec<Agent> = guard
            .values()
            .filter(|a| a.is_active() && a.has_identity())
            .cloned()
            .collect();
        // None sorts before Some, so never-scored agents come first.
        agents.sort_by(|a, b| {
            a.reputation_updated_at
                .cmp(&b.reputation_updated_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        agents.truncate(limit);
        Ok(agents)
    }

    async fn set_reputation(
        &self,
        agent_id: &AgentId,
        score: u32,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.check_online()?;
        let mut guard = write(&self.agents, "agents")?;
        let agent = guard
            .get_mut(agent_id)
            .ok_or_else(|| StorageError::NotFound(format!("agent {agent_id} not found")))?;
        agent.reputation_score = Some(score);
        agent.reputation_updated_at = Some(at);
        Ok(())
    }

    async fn touch_agent(
        &self,
        agent_id: &AgentId,
        at: DateTime<Utc>,
        messages_processed: u64,
    ) -> StorageResult<()> {
        self.check_online()?;
        let mut guard = write(&self.agents, "agents")?;
        let agent = guard
            .get_mut(agent_id)
            .ok_or_else(|| StorageError::NotFound(format!("agent {agent_id} not found")))?;
        agent.last_active_at = Some(at);
        agent.messages_processed += messages_processed;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryConcordStore {
    async fn insert_message(&self, message: Message) -> StorageResult<()> {
        self.check_online()?;
        let notify = !message.processed;
        let id = message.message_id.clone();
        {
            let mut guard = write(&self.messages, "messages")?;
            if guard.contains_key(&id) {
                return Err(StorageError::Conflict(format!("message {id} already exists")));
            }
            guard.insert(id.clone(), message);
        }
        if notify {
            self.notify(ChangeNotification::MessageInserted(id));
        }
        Ok(())
    }

    async fn get_message(&self, message_id: &MessageId) -> StorageResult<Option<Message>> {
        self.check_online()?;
        Ok(read(&self.messages, "messages")?.get(message_id).cloned())
    }

    async fn claim_message(
        &self,
        message_id: &MessageId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<ClaimOutcome> {
        self.check_online()?;
        let mut guard = write(&self.messages, "messages")?;
        let message = guard
            .get_mut(message_id)
            .ok_or_else(|| StorageError::NotFound(format!("message {message_id} not found")))?;
        Ok(message.try_claim(owner, now, ttl))
    }

    async fn finalize_message(
        &self,
        message_id: &MessageId,
        owner: &str,
        outcome: MessageOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        self.check_online()?;
        let mut guard = write(&self.messages, "messages")?;
        let message = guard
            .get_mut(message_id)
            .ok_or_else(|| StorageError::NotFound(format!("message {message_id} not found")))?;
        Ok(message.finalize(owner, outcome, now))
    }

    async fn list_stale_messages(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        self.check_online()?;
        let guard = read(&self.messages, "messages")?;
        let mut stale: Vec<Message> = guard
            .values()
            .filter(|m| !m.processed && !m.is_system() && m.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stale.truncate(limit);
        Ok(stale)
    }
}

#[async_trait]
impl ProposalStore for InMemoryConcordStore {
    async fn insert_proposal(&self, proposal: Proposal) -> StorageResult<()> {
        self.check_online()?;
        let notify = proposal.status == ProposalStatus::Pending;
        let id = proposal.proposal_id.clone();
        {
            let mut guard = write(&self.proposals, "proposals")?;
            if guard.contains_key(&id) {
                return Err(StorageError::Conflict(format!("proposal {id} already exists")));
            }
            guard.insert(id.clone(), proposal);
        }
        if notify {
            self.notify(ChangeNotification::ProposalInserted(id));
        }
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &ProposalId) -> StorageResult<Option<Proposal>> {
        self.check_online()?;
        Ok(read(&self.proposals, "proposals")?.get(proposal_id).cloned())
    }

    async fn claim_proposal(
        &self,
        proposal_id: &ProposalId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<ClaimOutcome> {
        self.check_online()?;
        let mut guard = write(&self.proposals, "proposals")?;
        let proposal = guard
            .get_mut(proposal_id)
            .ok_or_else(|| StorageError::NotFound(format!("proposal {proposal_id} not found")))?;
        Ok(proposal.try_claim(owner, now, ttl))
    }

    async fn release_proposal(
        &self,
        proposal_id: &ProposalId,
        owner: &str,
        outcome: Option<ProposalOutcome>,
    ) -> StorageResult<bool> {
        self.check_online()?;
        let mut guard = write(&self.proposals, "proposals")?;
        let proposal = guard
            .get_mut(proposal_id)
            .ok_or_else(|| StorageError::NotFound(format!("proposal {proposal_id} not found")))?;
        Ok(proposal.release_claim(owner, outcome))
    }

    async fn transition_proposal(
        &self,
        proposal_id: &ProposalId,
        expected: &[ProposalStatus],
        change: ProposalTransition,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        self.check_online()?;
        let mut guard = write(&self.proposals, "proposals")?;
        let proposal = guard
            .get_mut(proposal_id)
            .ok_or_else(|| StorageError::NotFound(format!("proposal {proposal_id} not found")))?;
        Ok(proposal.transition(expected, &change, now))
    }

    async fn list_stale_proposals(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Proposal>> {
        self.check_online()?;
        let guard = read(&self.proposals, "proposals")?;
        let mut stale: Vec<Proposal> = guard
            .values()
            .filter(|p| p.status == ProposalStatus::Pending && p.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stale.truncate(limit);
        Ok(stale)
    }
}

#[async_trait]
impl RoundStore for InMemoryConcordStore {
    async fn insert_round(&self, round: ConsensusRound) -> StorageResult<()> {
        self.check_online()?;
        let mut guard = write(&self.rounds, "rounds")?;
        if guard.contains_key(&round.round_id) {
            return Err(StorageError::Conflict(format!(
                "round {} already exists",
                round.round_id
            )));
        }
        if guard
            .values()
            .any(|r| r.proposal_id == round.proposal_id && r.is_open())
        {
            return Err(StorageError::Conflict(format!(
                "proposal {} already has an open round",
                round.proposal_id
            )));
        }
        guard.insert(round.round_id.clone(), round);
        Ok(())
    }

    async fn get_round(&self, round_id: &RoundId) -> StorageResult<Option<ConsensusRound>> {
        self.check_online()?;
        Ok(read(&self.rounds, "rounds")?.get(round_id).cloned())
    }

    async fn open_round_for_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> StorageResult<Option<ConsensusRound>> {
        self.check_online()?;
        Ok(read(&self.rounds, "rounds")?
            .values()
            .find(|r| &r.proposal_id == proposal_id && r.is_open())
            .cloned())
    }

    async fn list_open_rounds(
        &self,
        deadline_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<ConsensusRound>> {
        self.check_online()?;
        let guard = read(&self.rounds, "rounds")?;
        let mut open: Vec<ConsensusRound> = guard
            .values()
            .filter(|r| r.is_open())
            .filter(|r| deadline_before.map_or(true, |cutoff| r.voting_deadline < cutoff))
            .cloned()
            .collect();
        open.sort_by(|a, b| a.voting_deadline.cmp(&b.voting_deadline));
        open.truncate(limit);
        Ok(open)
    }

    async fn close_round(
        &self,
        round_id: &RoundId,
        outcome: RoundOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        self.check_online()?;
        let mut guard = write(&self.rounds, "rounds")?;
        let round = guard
            .get_mut(round_id)
            .ok_or_else(|| StorageError::NotFound(format!("round {round_id} not found")))?;
        Ok(round.close(outcome, now))
    }
}

#[async_trait]
impl VoteStore for InMemoryConcordStore {
    async fn insert_vote(&self, vote: Vote) -> StorageResult<()> {
        self.check_online()?;
        let mut guard = write(&self.votes, "votes")?;
        let key = (vote.proposal_id.clone(), vote.agent_id.clone());
        if guard.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "agent {} already voted on proposal {}",
                vote.agent_id, vote.proposal_id
            )));
        }
        guard.insert(key, vote);
        Ok(())
    }

    async fn list_votes(&self, round_id: &RoundId) -> StorageResult<Vec<Vote>> {
        self.check_online()?;
        let guard = read(&self.votes, "votes")?;
        let mut votes: Vec<Vote> = guard
            .values()
            .filter(|v| &v.round_id == round_id)
            .cloned()
            .collect();
        votes.sort_by(|a, b| a.cast_at.cmp(&b.cast_at));
        Ok(votes)
    }

    async fn has_voted(&self, agent_id: &AgentId, proposal_id: &ProposalId) -> StorageResult<bool> {
        self.check_online()?;
        Ok(read(&self.votes, "votes")?.contains_key(&(proposal_id.clone(), agent_id.clone())))
    }
}

#[async_trait]
impl ActivityStore for InMemoryConcordStore {
    async fn record_activity(&self, record: ActivityRecord) -> StorageResult<()> {
        self.check_online()?;
        let mut guard = write(&self.activities, "activities")?;
        if guard.contains_key(&record.activity_id) {
            return Err(StorageError::Conflict(format!(
                "activity {} already exists",
                record.activity_id
            )));
        }
        guard.insert(record.activity_id.clone(), record);
        Ok(())
    }

    async fn count_confirmed_activities(&self, agent_id: &AgentId) -> StorageResult<u64> {
        self.check_online()?;
        let guard = read(&self.activities, "activities")?;
        Ok(guard
            .values()
            .filter(|a| &a.agent_id == agent_id && a.status == ActivityStatus::Confirmed)
            .count() as u64)
    }

    async fn list_activities(&self, agent_id: &AgentId) -> StorageResult<Vec<ActivityRecord>> {
        self.check_online()?;
        let guard = read(&self.activities, "activities")?;
        let mut records: Vec<ActivityRecord> = guard
            .values()
            .filter(|a| &a.agent_id == agent_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn prune_activities(
        &self,
        created_before: DateTime<Utc>,
        keep_types: &[String],
    ) -> StorageResult<u64> {
        self.check_online()?;
        let mut guard = write(&self.activities, "activities")?;
        let before = guard.len();
        guard.retain(|_, a| {
            a.durable || a.created_at >= created_before || keep_types.contains(&a.activity_type)
        });
        Ok((before - guard.len()) as u64)
    }
}

#[async_trait]
impl TaskStore for InMemoryConcordStore {
    async fn insert_task(&self, task: TaskRecord) -> StorageResult<()> {
        self.check_online()?;
        let mut guard = write(&self.tasks, "tasks")?;
        if guard.contains_key(&task.task_id) {
            return Err(StorageError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        guard.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> StorageResult<Option<TaskRecord>> {
        self.check_online()?;
        Ok(read(&self.tasks, "tasks")?.get(task_id).cloned())
    }

    async fn list_tasks_for_message(
        &self,
        message_id: &MessageId,
    ) -> StorageResult<Vec<TaskRecord>> {
        self.check_online()?;
        let guard = read(&self.tasks, "tasks")?;
        let mut tasks: Vec<TaskRecord> = guard
            .values()
            .filter(|t| &t.message_id == message_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }

    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.check_online()?;
        let mut guard = write(&self.tasks, "tasks")?;
        let task = guard
            .get_mut(task_id)
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id} not found")))?;
        task.status = status;
        task.updated_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl StoreHealth for InMemoryConcordStore {
    async fn ping(&self) -> StorageResult<()> {
        self.check_online()
    }
}

impl ChangeFeed for InMemoryConcordStore {
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{MessageStatus, Priority, RoundStatus, VoteChoice};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn round(proposal: &str, round_id: &str, deadline: DateTime<Utc>) -> ConsensusRound {
        ConsensusRound {
            round_id: RoundId::new(round_id),
            proposal_id: ProposalId::new(proposal),
            eligible_voters: vec![],
            voting_weights: BTreeMap::new(),
            consensus_threshold: 60,
            voting_deadline: deadline,
            status: RoundStatus::Voting,
            outcome: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn message_insert_notifies_and_rejects_duplicates() {
        let store = InMemoryConcordStore::new();
        let mut feed = store.subscribe();
        let msg = Message::new("a-1", "request", json!({})).with_id("m-1");

        store.insert_message(msg.clone()).await.unwrap();
        assert_eq!(
            feed.recv().await.unwrap(),
            ChangeNotification::MessageInserted(MessageId::new("m-1"))
        );

        let err = store.insert_message(msg).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn system_messages_are_not_announced() {
        let store = InMemoryConcordStore::new();
        let mut feed = store.subscribe();
        let msg = Message::system(
            MessageId::new("vote_invitation:p:a"),
            AgentId::new("a"),
            "voting_invitation",
            json!({}),
            None,
        );
        store.insert_message(msg).await.unwrap();
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn claim_then_finalize_marks_processed() {
        let store = InMemoryConcordStore::new();
        let msg = Message::new("a-1", "request", json!({})).with_id("m-1");
        store.insert_message(msg).await.unwrap();
        let id = MessageId::new("m-1");
        let now = Utc::now();

        let first = store
            .claim_message(&id, "w1", now, Duration::seconds(60))
            .await
            .unwrap();
        assert!(first.is_acquired());
        let second = store
            .claim_message(&id, "w2", now, Duration::seconds(60))
            .await
            .unwrap();
        assert!(matches!(second, ClaimOutcome::Contended { .. }));

        let outcome = MessageOutcome::new(id.clone(), MessageStatus::Processed);
        assert!(store.finalize_message(&id, "w1", outcome.clone(), now).await.unwrap());
        assert!(!store.finalize_message(&id, "w1", outcome, now).await.unwrap());

        let stored = store.get_message(&id).await.unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(
            store
                .claim_message(&id, "w2", now, Duration::seconds(60))
                .await
                .unwrap(),
            ClaimOutcome::Finished
        );
    }

    #[tokio::test]
    async fn stale_messages_oldest_first() {
        let store = InMemoryConcordStore::new();
        let now = Utc::now();
        for (id, age) in [("m-new", 1), ("m-old", 30), ("m-mid", 10)] {
            let msg = Message::new("a", "request", json!({}))
                .with_id(id)
                .created_at(now - Duration::minutes(age));
            store.insert_message(msg).await.unwrap();
        }

        let stale = store
            .list_stale_messages(now - Duration::minutes(5), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = stale.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m-old", "m-mid"]);
    }

    #[tokio::test]
    async fn one_open_round_per_proposal() {
        let store = InMemoryConcordStore::new();
        let deadline = Utc::now() + Duration::hours(1);
        store.insert_round(round("p-1", "r-1", deadline)).await.unwrap();
        let err = store
            .insert_round(round("p-1", "r-2", deadline))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let now = Utc::now();
        assert!(store
            .close_round(&RoundId::new("r-1"), RoundOutcome::Rejected, now)
            .await
            .unwrap());
        assert!(!store
            .close_round(&RoundId::new("r-1"), RoundOutcome::Accepted, now)
            .await
            .unwrap());
        store.insert_round(round("p-1", "r-2", deadline)).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_vote_rejected() {
        let store = InMemoryConcordStore::new();
        let vote = Vote {
            agent_id: AgentId::new("a"),
            proposal_id: ProposalId::new("p"),
            round_id: RoundId::new("r"),
            choice: VoteChoice::Approve,
            reasoning: String::new(),
            weight: 100,
            cast_at: Utc::now(),
        };
        store.insert_vote(vote.clone()).await.unwrap();
        let second = Vote {
            choice: VoteChoice::Reject,
            ..vote
        };
        assert!(store.insert_vote(second).await.unwrap_err().is_conflict());

        let votes = store.list_votes(&RoundId::new("r")).await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].choice, VoteChoice::Approve);
    }

    #[tokio::test]
    async fn prune_keeps_durable_and_protected_types() {
        let store = InMemoryConcordStore::new();
        let old = Utc::now() - Duration::days(40);
        let agent = AgentId::new("a");
        let records = [
            ActivityRecord::confirmed(ActivityId::new("1"), agent.clone(), "message_processed", json!({}))
                .created_at(old),
            ActivityRecord::confirmed(ActivityId::new("2"), agent.clone(), "escrow_created", json!({}))
                .created_at(old),
            ActivityRecord::confirmed(ActivityId::new("3"), agent.clone(), "message_processed", json!({}))
                .created_at(old)
                .durable(),
            ActivityRecord::confirmed(ActivityId::new("4"), agent.clone(), "message_processed", json!({})),
        ];
        for r in records {
            store.record_activity(r).await.unwrap();
        }

        let removed = store
            .prune_activities(Utc::now() - Duration::days(30), &["escrow_created".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count_confirmed_activities(&agent).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = InMemoryConcordStore::new();
        store.set_offline(true);
        assert!(store.ping().await.unwrap_err().is_transient());
        assert!(store.get_agent(&AgentId::new("a")).await.is_err());
        store.set_offline(false);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn tasks_are_keyed_by_assignment() {
        let store = InMemoryConcordStore::new();
        let task = TaskRecord::started(AgentId::new("b"), MessageId::new("m"), 650, Priority::Medium);
        store.insert_task(task.clone()).await.unwrap();
        assert!(store.insert_task(task.clone()).await.unwrap_err().is_conflict());

        store
            .update_task_status(&task.task_id, TaskStatus::Completed, Utc::now())
            .await
            .unwrap();
        let tasks = store
            .list_tasks_for_message(&MessageId::new("m"))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn routable_agents_ordered_by_recency() {
        let store = InMemoryConcordStore::new();
        let now = Utc::now();
        let mut older = Agent::new("old", "old")
            .with_identity_proof(concord_types::IdentityProof::new("x"));
        older.last_active_at = Some(now - Duration::hours(2));
        let mut newer = Agent::new("new", "new")
            .with_identity_proof(concord_types::IdentityProof::new("y"));
        newer.last_active_at = Some(now);
        let bare = Agent::new("bare", "no identity");

        for a in [older, newer, bare] {
            store.upsert_agent(a).await.unwrap();
        }

        let agents = store.list_agents(AgentFilter::routable()).await.unwrap();
        let ids: Vec<&str> = agents.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }
}
