//! Concord domain types.
//!
//! Plain data shared by the store, the engine and the daemon: agents,
//! messages, proposals, consensus rounds, votes, activity records and the
//! structured outcomes of the engine operations. Processing leases live
//! here too so every store backend applies the same claim rule.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod activity;
pub mod agent;
pub mod change;
pub mod claim;
pub mod consensus;
pub mod ids;
pub mod message;
pub mod outcome;
pub mod proposal;

pub use activity::{ActivityRecord, ActivityStatus, TaskRecord, TaskStatus};
pub use agent::{Agent, AgentStatus, IdentityProof, DEFAULT_SUCCESS_RATE, DEFAULT_VOTING_POWER};
pub use change::ChangeNotification;
pub use claim::{Claim, ClaimOutcome};
pub use consensus::{
    ConsensusRound, RoundOutcome, RoundStatus, Tally, Vote, VoteChoice, VotingWeight,
};
pub use ids::{ActivityId, AgentId, MessageId, ProposalId, RoundId, TaskId};
pub use message::{Message, MessageOrigin};
pub use outcome::{
    HealthReport, HealthState, MessageOutcome, MessageStatus, Priority, ProactiveReport,
    ProposalDisposition, ProposalOutcome, VoteReceipt, VoteRejection,
};
pub use proposal::{Proposal, ProposalStatus, ProposalTransition};
