//! Activity and task records.

use crate::ids::{ActivityId, AgentId, MessageId, TaskId};
use crate::outcome::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Confirmed,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Confirmed => "confirmed",
            ActivityStatus::Failed => "failed",
        }
    }
}

/// Audit row for something an agent did. Confirmed activities feed the
/// reputation score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub activity_id: ActivityId,
    pub agent_id: AgentId,
    pub activity_type: String,
    pub status: ActivityStatus,
    /// Durable activities survive retention sweeps.
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn confirmed(
        activity_id: ActivityId,
        agent_id: AgentId,
        activity_type: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            activity_id,
            agent_id,
            activity_type: activity_type.into(),
            status: ActivityStatus::Confirmed,
            durable: false,
            details,
            created_at: Utc::now(),
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Started,
    Completed,
    Failed,
}

/// Work handed to a target agent for one routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub message_id: MessageId,
    pub sender_reputation: u32,
    pub priority: Priority,
    pub verified: bool,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn started(
        agent_id: AgentId,
        message_id: MessageId,
        sender_reputation: u32,
        priority: Priority,
    ) -> Self {
        Self {
            task_id: TaskId::for_assignment(&message_id, &agent_id),
            agent_id,
            message_id,
            sender_reputation,
            priority,
            verified: true,
            status: TaskStatus::Started,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}
