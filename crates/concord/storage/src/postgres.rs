//! PostgreSQL adapter for Concord storage.
//!
//! Each record is kept as a JSONB `data` document next to the key columns
//! the queries filter on. Compare-and-set operations lock the row with
//! `SELECT ... FOR UPDATE`, apply the shared rule from `concord-types` and
//! write the document back inside the same transaction.
//!
//! Inserts of unprocessed messages and pending proposals fire a
//! `pg_notify` trigger; [`PostgresConcordStore::spawn_change_listener`]
//! forwards those notifications onto the in-process change feed.

use crate::traits::{
    ActivityStore, AgentFilter, AgentStore, ChangeFeed, MessageStore, ProposalStore, RoundStore,
    StoreHealth, TaskStore, VoteStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use concord_types::{
    ActivityRecord, Agent, AgentId, ChangeNotification, ClaimOutcome, ConsensusRound, Message,
    MessageId, MessageOutcome, Proposal, ProposalId, ProposalOutcome, ProposalStatus,
    ProposalTransition, RoundId, RoundOutcome, RoundStatus, TaskId, TaskRecord, TaskStatus, Vote,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgConnection, PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const CHANGE_CHANNEL: &str = "concord_changes";
const CHANGE_FEED_CAPACITY: usize = 1024;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresConcordStore {
    pool: PgPool,
    changes: broadcast::Sender<ChangeNotification>,
}

impl PostgresConcordStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let store = Self { pool, changes };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Forward `pg_notify` insert events onto the change feed until the
    /// listener connection fails.
    pub async fn spawn_change_listener(&self) -> StorageResult<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("listener connect failed: {e}")))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| StorageError::Backend(format!("listen failed: {e}")))?;

        let changes = self.changes.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<ChangeNotification>(notification.payload()) {
                            Ok(change) => {
                                let _ = changes.send(change);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, payload = notification.payload(), "Ignoring malformed change notification");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Change listener stopped");
                        break;
                    }
                }
            }
        }))
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS concord_agents (
                agent_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                has_identity BOOLEAN NOT NULL,
                recency TIMESTAMPTZ NOT NULL,
                reputation_updated_at TIMESTAMPTZ,
                data JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS concord_messages (
                message_id TEXT PRIMARY KEY,
                processed BOOLEAN NOT NULL,
                origin TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS concord_proposals (
                proposal_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS concord_rounds (
                round_id TEXT PRIMARY KEY,
                proposal_id TEXT NOT NULL,
                status TEXT NOT NULL,
                voting_deadline TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS concord_rounds_one_open
                ON concord_rounds (proposal_id) WHERE status = 'voting'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS concord_votes (
                proposal_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                round_id TEXT NOT NULL,
                cast_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL,
                PRIMARY KEY (proposal_id, agent_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS concord_activities (
                activity_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                activity_type TEXT NOT NULL,
                status TEXT NOT NULL,
                durable BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS concord_tasks (
                task_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                data JSONB NOT NULL
            )
            "#,
            r#"
            CREATE OR REPLACE FUNCTION concord_notify_message() RETURNS trigger AS $$
            BEGIN
                IF NOT NEW.processed THEN
                    PERFORM pg_notify('concord_changes',
                        json_build_object('kind', 'message_inserted', 'id', NEW.message_id)::text);
                END IF;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql
            "#,
            r#"
            CREATE OR REPLACE FUNCTION concord_notify_proposal() RETURNS trigger AS $$
            BEGIN
                IF NEW.status = 'pending' THEN
                    PERFORM pg_notify('concord_changes',
                        json_build_object('kind', 'proposal_inserted', 'id', NEW.proposal_id)::text);
                END IF;
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql
            "#,
            "DROP TRIGGER IF EXISTS concord_messages_notify ON concord_messages",
            r#"
            CREATE TRIGGER concord_messages_notify AFTER INSERT ON concord_messages
                FOR EACH ROW EXECUTE FUNCTION concord_notify_message()
            "#,
            "DROP TRIGGER IF EXISTS concord_proposals_notify ON concord_proposals",
            r#"
            CREATE TRIGGER concord_proposals_notify AFTER INSERT ON concord_proposals
                FOR EACH ROW EXECUTE FUNCTION concord_notify_proposal()
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn begin(&self) -> StorageResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool.begin().await.map_err(backend)
    }
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_json<T: Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_row<T: DeserializeOwned>(row: &PgRow) -> StorageResult<T> {
    let data: serde_json::Value = row.try_get("data").map_err(backend)?;
    serde_json::from_value(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_rows<T: DeserializeOwned>(rows: Vec<PgRow>) -> StorageResult<Vec<T>> {
    rows.iter().map(from_row).collect()
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| StorageError::InvalidInput("limit too large".to_string()))
}

async fn fetch_locked<T: DeserializeOwned>(
    conn: &mut PgConnection,
    sql: &str,
    id: &str,
) -> StorageResult<Option<T>> {
    let row = sqlx::query(sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;
    row.as_ref().map(from_row).transpose()
}

fn round_status_str(status: RoundStatus) -> &'static str {
    match status {
        RoundStatus::Voting => "voting",
        RoundStatus::Closed => "closed",
    }
}

async fn save_agent(conn: &mut PgConnection, agent: &Agent) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO concord_agents (agent_id, status, has_identity, recency, reputation_updated_at, data)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (agent_id) DO UPDATE
           SET status = EXCLUDED.status,
               has_identity = EXCLUDED.has_identity,
               recency = EXCLUDED.recency,
               reputation_updated_at = EXCLUDED.reputation_updated_at,
               data = EXCLUDED.data
        "#,
    )
    .bind(agent.agent_id.as_str())
    .bind(agent.status.to_string())
    .bind(agent.has_identity())
    .bind(agent.recency())
    .bind(agent.reputation_updated_at)
    .bind(to_json(agent)?)
    .execute(&mut *conn)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn save_message(conn: &mut PgConnection, message: &Message) -> StorageResult<()> {
    sqlx::query("UPDATE concord_messages SET processed = $2, data = $3 WHERE message_id = $1")
        .bind(message.message_id.as_str())
        .bind(message.processed)
        .bind(to_json(message)?)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    Ok(())
}

async fn save_proposal(conn: &mut PgConnection, proposal: &Proposal) -> StorageResult<()> {
    sqlx::query("UPDATE concord_proposals SET status = $2, data = $3 WHERE proposal_id = $1")
        .bind(proposal.proposal_id.as_str())
        .bind(proposal.status.as_str())
        .bind(to_json(proposal)?)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    Ok(())
}

#[async_trait]
impl AgentStore for PostgresConcordStore {
    async fn upsert_agent(&self, agent: Agent) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        save_agent(&mut *conn, &agent).await
    }

    async fn get_agent(&self, agent_id: &AgentId) -> StorageResult<Option<Agent>> {
        let row = sqlx::query("SELECT data FROM concord_agents WHERE agent_id = $1")
            .bind(agent_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(from_row).transpose()
    }

    async fn list_agents(&self, filter: AgentFilter) -> StorageResult<Vec<Agent>> {
        let limit = filter.limit.map(to_i64).transpose()?;
        let rows = sqlx::query(
            r#"
            SELECT data FROM concord_agents
             WHERE ($1 = FALSE OR status = 'active')
               AND ($2 = FALSE OR has_identity)
             ORDER BY recency DESC, agent_id ASC
             LIMIT $3
            "#,
        )
        .bind(filter.active_only)
        .bind(filter.identity_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        from_rows(rows)
    }

    async fn agents_due_for_reputation(&self, limit: usize) -> StorageResult<Vec<Agent>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM concord_agents
             WHERE status = 'active' AND has_identity
             ORDER BY reputation_updated_at ASC NULLS FIRST, agent_id ASC
             LIMIT $1
            "#,
        )
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        from_rows(rows)
    }

    async fn set_reputation(
        &self,
        agent_id: &AgentId,
        score: u32,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let mut agent: Agent = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_agents WHERE agent_id = $1 FOR UPDATE",
            agent_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("agent {agent_id} not found")))?;
        agent.reputation_score = Some(score);
        agent.reputation_updated_at = Some(at);
        save_agent(&mut *tx, &agent).await?;
        tx.commit().await.map_err(backend)
    }

    async fn touch_agent(
        &self,
        agent_id: &AgentId,
        at: DateTime<Utc>,
        messages_processed: u64,
    ) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let mut agent: Agent = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_agents WHERE agent_id = $1 FOR UPDATE",
            agent_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("agent {agent_id} not found")))?;
        agent.last_active_at = Some(at);
        agent.messages_processed += messages_processed;
        save_agent(&mut *tx, &agent).await?;
        tx.commit().await.map_err(backend)
    }
}

#[async_trait]
impl MessageStore for PostgresConcordStore {
    async fn insert_message(&self, message: Message) -> StorageResult<()> {
        let origin = if message.is_system() { "system" } else { "agent" };
        sqlx::query(
            r#"
            INSERT INTO concord_messages (message_id, processed, origin, created_at, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.message_id.as_str())
        .bind(message.processed)
        .bind(origin)
        .bind(message.created_at)
        .bind(to_json(&message)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_message(&self, message_id: &MessageId) -> StorageResult<Option<Message>> {
        let row = sqlx::query("SELECT data FROM concord_messages WHERE message_id = $1")
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(from_row).transpose()
    }

    async fn claim_message(
        &self,
        message_id: &MessageId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<ClaimOutcome> {
        let mut tx = self.begin().await?;
        let mut message: Message = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_messages WHERE message_id = $1 FOR UPDATE",
            message_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("message {message_id} not found")))?;

        let outcome = message.try_claim(owner, now, ttl);
        if outcome.is_acquired() {
            save_message(&mut *tx, &message).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(outcome)
    }

    async fn finalize_message(
        &self,
        message_id: &MessageId,
        owner: &str,
        outcome: MessageOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut tx = self.begin().await?;
        let mut message: Message = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_messages WHERE message_id = $1 FOR UPDATE",
            message_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("message {message_id} not found")))?;

        let applied = message.finalize(owner, outcome, now);
        if applied {
            save_message(&mut *tx, &message).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(applied)
    }

    async fn list_stale_messages(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM concord_messages
             WHERE processed = FALSE AND origin = 'agent' AND created_at < $1
             ORDER BY created_at ASC
             LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        from_rows(rows)
    }
}

#[async_trait]
impl ProposalStore for PostgresConcordStore {
    async fn insert_proposal(&self, proposal: Proposal) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO concord_proposals (proposal_id, status, created_at, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(proposal.proposal_id.as_str())
        .bind(proposal.status.as_str())
        .bind(proposal.created_at)
        .bind(to_json(&proposal)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &ProposalId) -> StorageResult<Option<Proposal>> {
        let row = sqlx::query("SELECT data FROM concord_proposals WHERE proposal_id = $1")
            .bind(proposal_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(from_row).transpose()
    }

    async fn claim_proposal(
        &self,
        proposal_id: &ProposalId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageResult<ClaimOutcome> {
        let mut tx = self.begin().await?;
        let mut proposal: Proposal = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_proposals WHERE proposal_id = $1 FOR UPDATE",
            proposal_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("proposal {proposal_id} not found")))?;

        let outcome = proposal.try_claim(owner, now, ttl);
        if outcome.is_acquired() {
            save_proposal(&mut *tx, &proposal).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(outcome)
    }

    async fn release_proposal(
        &self,
        proposal_id: &ProposalId,
        owner: &str,
        outcome: Option<ProposalOutcome>,
    ) -> StorageResult<bool> {
        let mut tx = self.begin().await?;
        let mut proposal: Proposal = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_proposals WHERE proposal_id = $1 FOR UPDATE",
            proposal_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("proposal {proposal_id} not found")))?;

        let released = proposal.release_claim(owner, outcome);
        if released {
            save_proposal(&mut *tx, &proposal).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(released)
    }

    async fn transition_proposal(
        &self,
        proposal_id: &ProposalId,
        expected: &[ProposalStatus],
        change: ProposalTransition,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut tx = self.begin().await?;
        let mut proposal: Proposal = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_proposals WHERE proposal_id = $1 FOR UPDATE",
            proposal_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("proposal {proposal_id} not found")))?;

        let applied = proposal.transition(expected, &change, now);
        if applied {
            save_proposal(&mut *tx, &proposal).await?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(applied)
    }

    async fn list_stale_proposals(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Proposal>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM concord_proposals
             WHERE status = 'pending' AND created_at < $1
             ORDER BY created_at ASC
             LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        from_rows(rows)
    }
}

#[async_trait]
impl RoundStore for PostgresConcordStore {
    async fn insert_round(&self, round: ConsensusRound) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO concord_rounds (round_id, proposal_id, status, voting_deadline, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(round.round_id.as_str())
        .bind(round.proposal_id.as_str())
        .bind(round_status_str(round.status))
        .bind(round.voting_deadline)
        .bind(to_json(&round)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_round(&self, round_id: &RoundId) -> StorageResult<Option<ConsensusRound>> {
        let row = sqlx::query("SELECT data FROM concord_rounds WHERE round_id = $1")
            .bind(round_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(from_row).transpose()
    }

    async fn open_round_for_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> StorageResult<Option<ConsensusRound>> {
        let row = sqlx::query(
            "SELECT data FROM concord_rounds WHERE proposal_id = $1 AND status = 'voting'",
        )
        .bind(proposal_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(from_row).transpose()
    }

    async fn list_open_rounds(
        &self,
        deadline_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<ConsensusRound>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM concord_rounds
             WHERE status = 'voting'
               AND ($1::TIMESTAMPTZ IS NULL OR voting_deadline < $1)
             ORDER BY voting_deadline ASC
             LIMIT $2
            "#,
        )
        .bind(deadline_before)
        .bind(to_i64(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        from_rows(rows)
    }

    async fn close_round(
        &self,
        round_id: &RoundId,
        outcome: RoundOutcome,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut tx = self.begin().await?;
        let mut round: ConsensusRound = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_rounds WHERE round_id = $1 FOR UPDATE",
            round_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("round {round_id} not found")))?;

        let closed = round.close(outcome, now);
        if closed {
            sqlx::query("UPDATE concord_rounds SET status = $2, data = $3 WHERE round_id = $1")
                .bind(round.round_id.as_str())
                .bind(round_status_str(round.status))
                .bind(to_json(&round)?)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(closed)
    }
}

#[async_trait]
impl VoteStore for PostgresConcordStore {
    async fn insert_vote(&self, vote: Vote) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO concord_votes (proposal_id, agent_id, round_id, cast_at, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(vote.proposal_id.as_str())
        .bind(vote.agent_id.as_str())
        .bind(vote.round_id.as_str())
        .bind(vote.cast_at)
        .bind(to_json(&vote)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn list_votes(&self, round_id: &RoundId) -> StorageResult<Vec<Vote>> {
        let rows =
            sqlx::query("SELECT data FROM concord_votes WHERE round_id = $1 ORDER BY cast_at ASC")
                .bind(round_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        from_rows(rows)
    }

    async fn has_voted(&self, agent_id: &AgentId, proposal_id: &ProposalId) -> StorageResult<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM concord_votes WHERE proposal_id = $1 AND agent_id = $2",
        )
        .bind(proposal_id.as_str())
        .bind(agent_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ActivityStore for PostgresConcordStore {
    async fn record_activity(&self, record: ActivityRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO concord_activities
                (activity_id, agent_id, activity_type, status, durable, created_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.activity_id.as_str())
        .bind(record.agent_id.as_str())
        .bind(record.activity_type.as_str())
        .bind(record.status.as_str())
        .bind(record.durable)
        .bind(record.created_at)
        .bind(to_json(&record)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn count_confirmed_activities(&self, agent_id: &AgentId) -> StorageResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM concord_activities WHERE agent_id = $1 AND status = 'confirmed'",
        )
        .bind(agent_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        let total: i64 = row.try_get("total").map_err(backend)?;
        Ok(total.max(0) as u64)
    }

    async fn list_activities(&self, agent_id: &AgentId) -> StorageResult<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            "SELECT data FROM concord_activities WHERE agent_id = $1 ORDER BY created_at ASC",
        )
        .bind(agent_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        from_rows(rows)
    }

    async fn prune_activities(
        &self,
        created_before: DateTime<Utc>,
        keep_types: &[String],
    ) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM concord_activities
             WHERE created_at < $1
               AND durable = FALSE
               AND NOT (activity_type = ANY($2))
            "#,
        )
        .bind(created_before)
        .bind(keep_types.to_vec())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskStore for PostgresConcordStore {
    async fn insert_task(&self, task: TaskRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO concord_tasks (task_id, message_id, agent_id, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(task.task_id.as_str())
        .bind(task.message_id.as_str())
        .bind(task.agent_id.as_str())
        .bind(to_json(&task)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> StorageResult<Option<TaskRecord>> {
        let row = sqlx::query("SELECT data FROM concord_tasks WHERE task_id = $1")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(from_row).transpose()
    }

    async fn list_tasks_for_message(
        &self,
        message_id: &MessageId,
    ) -> StorageResult<Vec<TaskRecord>> {
        let rows =
            sqlx::query("SELECT data FROM concord_tasks WHERE message_id = $1 ORDER BY task_id")
                .bind(message_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        from_rows(rows)
    }

    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let mut task: TaskRecord = fetch_locked(
            &mut *tx,
            "SELECT data FROM concord_tasks WHERE task_id = $1 FOR UPDATE",
            task_id.as_str(),
        )
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("task {task_id} not found")))?;
        task.status = status;
        task.updated_at = Some(at);
        sqlx::query("UPDATE concord_tasks SET data = $2 WHERE task_id = $1")
            .bind(task.task_id.as_str())
            .bind(to_json(&task)?)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)
    }
}

#[async_trait]
impl StoreHealth for PostgresConcordStore {
    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

impl ChangeFeed for PostgresConcordStore {
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }
}
