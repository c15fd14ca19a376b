//! Identifier newtypes.
//!
//! Agent, message and proposal ids come from outside the engine (whatever
//! the host store assigns) so they are opaque strings. Task and reminder ids
//! are derived deterministically from the entities they belong to so that
//! re-running a step never duplicates the record.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a registered agent.
    AgentId
);
string_id!(
    /// Identifier of an inter-agent message.
    MessageId
);
string_id!(
    /// Identifier of a governance proposal.
    ProposalId
);
string_id!(
    /// Identifier of a consensus round.
    RoundId
);
string_id!(
    /// Identifier of a task assignment.
    TaskId
);
string_id!(
    /// Identifier of an activity record.
    ActivityId
);

impl TaskId {
    /// Task ids are keyed on (message, assignee); a retried routing pass
    /// produces the same id and the insert is skipped.
    pub fn for_assignment(message_id: &MessageId, agent_id: &AgentId) -> Self {
        Self(format!("task:{}:{}", message_id, agent_id))
    }
}

impl MessageId {
    pub fn voting_invitation(proposal_id: &ProposalId, agent_id: &AgentId) -> Self {
        Self(format!("vote_invitation:{}:{}", proposal_id, agent_id))
    }

    pub fn voting_reminder(round_id: &RoundId, agent_id: &AgentId) -> Self {
        Self(format!("vote_reminder:{}:{}", round_id, agent_id))
    }
}

impl RoundId {
    pub fn for_proposal(proposal_id: &ProposalId) -> Self {
        Self(format!("round:{}:{}", proposal_id, uuid::Uuid::new_v4()))
    }
}

impl ActivityId {
    pub fn message_processed(message_id: &MessageId) -> Self {
        Self(format!("message_processed:{}", message_id))
    }

    pub fn proposal_processed(proposal_id: &ProposalId) -> Self {
        Self(format!("proposal_processed:{}", proposal_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_ids_are_stable() {
        let msg = MessageId::new("m-1");
        let agent = AgentId::new("a-1");
        assert_eq!(TaskId::for_assignment(&msg, &agent).as_str(), "task:m-1:a-1");
        assert_eq!(
            TaskId::for_assignment(&msg, &agent),
            TaskId::for_assignment(&msg, &agent)
        );

        let round = RoundId::new("r-9");
        assert_eq!(
            MessageId::voting_reminder(&round, &agent).as_str(),
            "vote_reminder:r-9:a-1"
        );
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = AgentId::new("agent-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"agent-7\"");
        let back: AgentId = serde_json::from_str("\"agent-7\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(ProposalId::generate(), ProposalId::generate());
    }
}
