//! Processing leases.
//!
//! A worker claims a message or proposal before processing it. The claim
//! carries an expiry so a worker that dies mid-flight does not block the
//! item forever: once the lease lapses another worker may take it over.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub owner: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            owner: owner.into(),
            claimed_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of trying to claim an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller now holds the lease.
    Acquired,
    /// The item already reached a final state; nothing to do.
    Finished,
    /// Another worker holds a live lease.
    Contended {
        owner: String,
        expires_at: DateTime<Utc>,
    },
}

impl ClaimOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired)
    }
}

/// Shared lease rule for every claimable record.
///
/// The same owner may re-acquire its own lease, which refreshes the expiry.
pub fn try_acquire(
    slot: &mut Option<Claim>,
    owner: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> ClaimOutcome {
    if let Some(existing) = slot.as_ref() {
        if existing.owner != owner && !existing.is_expired(now) {
            return ClaimOutcome::Contended {
                owner: existing.owner.clone(),
                expires_at: existing.expires_at,
            };
        }
    }
    *slot = Some(Claim::new(owner, now, ttl));
    ClaimOutcome::Acquired
}

/// Drop the lease if `owner` still holds it. Returns whether it was held.
pub fn release(slot: &mut Option<Claim>, owner: &str) -> bool {
    match slot {
        Some(claim) if claim.owner == owner => {
            *slot = None;
            true
        }
        _ => false,
    }
}

/// Whether `owner` may finalize the item: either it holds the lease, or
/// nobody does (the lease lapsed and was not taken over).
pub fn may_finalize(slot: &Option<Claim>, owner: &str, now: DateTime<Utc>) -> bool {
    match slot {
        None => true,
        Some(claim) => claim.owner == owner || claim.is_expired(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_lease_blocks_other_owners() {
        let now = Utc::now();
        let mut slot = None;
        assert!(try_acquire(&mut slot, "w1", now, Duration::seconds(60)).is_acquired());

        let outcome = try_acquire(&mut slot, "w2", now + Duration::seconds(10), Duration::seconds(60));
        assert!(matches!(outcome, ClaimOutcome::Contended { ref owner, .. } if owner == "w1"));
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let now = Utc::now();
        let mut slot = None;
        try_acquire(&mut slot, "w1", now, Duration::seconds(60));

        let later = now + Duration::seconds(61);
        assert!(try_acquire(&mut slot, "w2", later, Duration::seconds(60)).is_acquired());
        assert_eq!(slot.as_ref().map(|c| c.owner.as_str()), Some("w2"));
        assert!(!may_finalize(&slot, "w1", later));
    }

    #[test]
    fn release_only_by_owner() {
        let now = Utc::now();
        let mut slot = None;
        try_acquire(&mut slot, "w1", now, Duration::seconds(60));
        assert!(!release(&mut slot, "w2"));
        assert!(release(&mut slot, "w1"));
        assert!(slot.is_none());
    }
}
