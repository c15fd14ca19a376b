//! Concord storage abstractions.
//!
//! One async trait per record family, bundled into [`ConcordStore`]:
//! - agents and their reputation snapshots
//! - messages and proposals with processing leases
//! - consensus rounds and votes
//! - activity records and task assignments
//! - a change feed announcing newly inserted work
//!
//! The in-memory adapter backs tests and single-process deployments. The
//! Postgres adapter (feature `postgres`) is the durable source of truth.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryConcordStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresConcordStore;
pub use traits::{
    ActivityStore, AgentFilter, AgentStore, ChangeFeed, ConcordStore, MessageStore, ProposalStore,
    RoundStore, StoreHealth, TaskStore, VoteStore,
};
