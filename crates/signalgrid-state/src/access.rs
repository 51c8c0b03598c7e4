//! Access contracts used by the scheduling core.
//!
//! The scheduler only talks to the store through these traits, so any
//! backend offering per-intersection atomic compare-and-swap and expiring
//! leases can stand in for [`StateStore`](crate::StateStore).

use std::time::Duration;

use signal_core::{IntersectionId, IntersectionSpec};

use crate::error::StateResult;
use crate::types::SignalState;

/// Read access to configuration and versioned access to signal state.
pub trait SignalStore: Send + Sync {
    /// Validated config for an intersection.
    fn intersection(&self, id: &str) -> StateResult<Option<IntersectionSpec>>;

    /// Ids of every provisioned intersection.
    fn intersection_ids(&self) -> StateResult<Vec<IntersectionId>>;

    /// Current signal state; `SignalState::version` is the CAS token.
    fn read(&self, id: &str) -> StateResult<Option<SignalState>>;

    /// Replace the state only if its stored version is still
    /// `expected_version`. Returns `false` without writing otherwise.
    fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new_state: &SignalState,
    ) -> StateResult<bool>;
}

/// Expiring exclusive claims, one per intersection.
pub trait LeaseStore: Send + Sync {
    /// Claim `id` for `holder` until `now_ms + ttl`. Fails immediately
    /// (returns `false`) while another holder's lease is live.
    fn try_acquire(
        &self,
        id: &str,
        holder: &str,
        ttl: Duration,
        now_ms: u64,
    ) -> StateResult<bool>;

    /// Drop the lease if `holder` still owns it. Idempotent.
    fn release(&self, id: &str, holder: &str) -> StateResult<()>;

    /// Delete every lease that expired before `now_ms`.
    fn purge_expired(&self, now_ms: u64) -> StateResult<u32>;
}
