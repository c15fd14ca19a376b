//! Events the engine publishes to in-process listeners (agent runners,
//! the REST layer). Delivery is best effort; everything an event announces
//! is also in the store.

use chrono::{DateTime, Utc};
use concord_types::{
    AgentId, MessageId, Priority, ProposalId, RoundId, RoundOutcome, Tally, TaskId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskAssigned {
        task_id: TaskId,
        agent_id: AgentId,
        message_id: MessageId,
        priority: Priority,
    },
    VotingInvitation {
        agent_id: AgentId,
        proposal_id: ProposalId,
        round_id: RoundId,
        weight: u64,
        deadline: DateTime<Utc>,
    },
    VotingReminder {
        agent_id: AgentId,
        proposal_id: ProposalId,
        round_id: RoundId,
        deadline: DateTime<Utc>,
    },
    RoundClosed {
        round_id: RoundId,
        proposal_id: ProposalId,
        outcome: RoundOutcome,
        tally: Tally,
    },
}

impl EngineEvent {
    /// Agent the event is addressed to, if any.
    pub fn recipient(&self) -> Option<&AgentId> {
        match self {
            EngineEvent::TaskAssigned { agent_id, .. }
            | EngineEvent::VotingInvitation { agent_id, .. }
            | EngineEvent::VotingReminder { agent_id, .. } => Some(agent_id),
            EngineEvent::RoundClosed { .. } => None,
        }
    }
}
