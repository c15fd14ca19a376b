//! Inter-agent messages.

use crate::claim::{self, Claim, ClaimOutcome};
use crate::ids::{AgentId, MessageId};
use crate::outcome::MessageOutcome;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Sender id used on messages the engine itself emits.
pub const SYSTEM_SENDER: &str = "consensus_system";

pub const VOTING_INVITATION: &str = "voting_invitation";
pub const VOTING_REMINDER: &str = "voting_reminder";
pub const URGENT: &str = "urgent";

/// Where a message came from. System messages are created already
/// processed and never enter the routing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    Agent,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub sender_id: AgentId,
    #[serde(default)]
    pub recipient_ids: Vec<AgentId>,
    pub message_type: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub response_deadline: Option<DateTime<Utc>>,
    pub origin: MessageOrigin,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    /// Final outcome once processed, or the last transient failure.
    #[serde(default)]
    pub outcome: Option<MessageOutcome>,
    #[serde(default)]
    pub claim: Option<Claim>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender_id: impl Into<AgentId>,
        message_type: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            sender_id: sender_id.into(),
            recipient_ids: Vec::new(),
            message_type: message_type.into(),
            content,
            requires_response: false,
            response_deadline: None,
            origin: MessageOrigin::Agent,
            processed: false,
            processed_at: None,
            outcome: None,
            claim: None,
            created_at: Utc::now(),
        }
    }

    /// An engine-authored message. It is stored processed so the router
    /// never picks it up.
    pub fn system(
        message_id: MessageId,
        recipient: AgentId,
        message_type: impl Into<String>,
        content: serde_json::Value,
        response_deadline: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            sender_id: AgentId::new(SYSTEM_SENDER),
            recipient_ids: vec![recipient],
            message_type: message_type.into(),
            content,
            requires_response: true,
            response_deadline,
            origin: MessageOrigin::System,
            processed: true,
            processed_at: Some(now),
            outcome: None,
            claim: None,
            created_at: now,
        }
    }

    pub fn with_id(mut self, message_id: impl Into<MessageId>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_recipients(mut self, recipients: Vec<AgentId>) -> Self {
        self.recipient_ids = recipients;
        self
    }

    pub fn requiring_response(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.requires_response = true;
        self.response_deadline = deadline;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn is_system(&self) -> bool {
        self.origin == MessageOrigin::System
    }

    /// Capabilities listed under `content.required_capabilities`.
    /// Non-string entries are ignored.
    pub fn required_capabilities(&self) -> Vec<String> {
        self.content
            .get("required_capabilities")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_urgent(&self) -> bool {
        self.message_type == URGENT
    }

    pub fn try_claim(&mut self, owner: &str, now: DateTime<Utc>, ttl: Duration) -> ClaimOutcome {
        if self.processed {
            return ClaimOutcome::Finished;
        }
        claim::try_acquire(&mut self.claim, owner, now, ttl)
    }

    /// Store an outcome produced by `owner`.
    ///
    /// Final outcomes mark the message processed. A retryable failure is
    /// kept for inspection and the lease is dropped so a later sweep can
    /// retry. Returns false when the message was already processed or the
    /// lease belongs to someone else.
    pub fn finalize(&mut self, owner: &str, outcome: MessageOutcome, now: DateTime<Utc>) -> bool {
        if self.processed || !claim::may_finalize(&self.claim, owner, now) {
            return false;
        }
        if outcome.is_final() {
            self.processed = true;
            self.processed_at = Some(now);
        }
        self.outcome = Some(outcome);
        self.claim = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{MessageOutcome, MessageStatus};
    use serde_json::json;

    #[test]
    fn required_capabilities_skip_non_strings() {
        let msg = Message::new(
            "a-1",
            "request",
            json!({"required_capabilities": ["audit", 7, "legal"]}),
        );
        assert_eq!(msg.required_capabilities(), vec!["audit", "legal"]);

        let bare = Message::new("a-1", "request", json!("hello"));
        assert!(bare.required_capabilities().is_empty());
    }

    #[test]
    fn processed_message_cannot_be_claimed() {
        let now = Utc::now();
        let mut msg = Message::new("a-1", "request", json!({}));
        assert!(msg.try_claim("w1", now, Duration::seconds(30)).is_acquired());

        let outcome = MessageOutcome::new(msg.message_id.clone(), MessageStatus::Filtered);
        assert!(msg.finalize("w1", outcome, now));
        assert!(msg.processed);
        assert!(msg.claim.is_none());
        assert_eq!(
            msg.try_claim("w2", now, Duration::seconds(30)),
            ClaimOutcome::Finished
        );
    }

    #[test]
    fn retryable_failure_leaves_message_pending() {
        let now = Utc::now();
        let mut msg = Message::new("a-1", "request", json!({}));
        msg.try_claim("w1", now, Duration::seconds(30));

        let outcome = MessageOutcome::new(msg.message_id.clone(), MessageStatus::Failed)
            .with_reason("store timed out")
            .retryable();
        assert!(msg.finalize("w1", outcome, now));
        assert!(!msg.processed);
        assert!(msg.claim.is_none());
        assert!(msg.outcome.as_ref().is_some_and(|o| o.retryable));
    }

    #[test]
    fn system_messages_start_processed() {
        let msg = Message::system(
            MessageId::new("vote_invitation:p:a"),
            AgentId::new("a"),
            VOTING_INVITATION,
            json!({}),
            None,
        );
        assert!(msg.processed);
        assert!(msg.is_system());
        assert_eq!(msg.sender_id.as_str(), SYSTEM_SENDER);
    }
}
