use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live counters for the replication engine. Cheap to clone.
pub struct ProtocolStatistics(Arc<ProtocolStatisticsInner>);

impl Deref for ProtocolStatistics {
    type Target = ProtocolStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ProtocolStatisticsInner {
    /// Delay tasks created for a key that had no pending task.
    pub(crate) sync_tasks_submitted: Counter,
    /// Operations merged into an already pending task instead of queueing.
    pub(crate) sync_tasks_coalesced: Counter,
    /// Pushes acknowledged by a peer.
    pub(crate) sync_sends_success: Counter,
    /// Pushes that failed or timed out.
    pub(crate) sync_sends_failed: Counter,
    /// Tasks dropped after exhausting their retry budget.
    pub(crate) retries_exhausted: Counter,
    /// Pulls scheduled in response to checksum mismatches.
    pub(crate) pulls_issued: Counter,
    /// Deletes applied because a key vanished from its owner's batch.
    pub(crate) removals_applied: Counter,
    /// Completed verification cycles.
    pub(crate) verify_cycles: Counter,
}

impl ProtocolStatisticsInner {
    pub fn sync_tasks_submitted(&self) -> u64 {
        self.sync_tasks_submitted.load(Ordering::Relaxed)
    }

    pub fn sync_tasks_coalesced(&self) -> u64 {
        self.sync_tasks_coalesced.load(Ordering::Relaxed)
    }

    pub fn sync_sends_success(&self) -> u64 {
        self.sync_sends_success.load(Ordering::Relaxed)
    }

    pub fn sync_sends_failed(&self) -> u64 {
        self.sync_sends_failed.load(Ordering::Relaxed)
    }

    pub fn retries_exhausted(&self) -> u64 {
        self.retries_exhausted.load(Ordering::Relaxed)
    }

    pub fn pulls_issued(&self) -> u64 {
        self.pulls_issued.load(Ordering::Relaxed)
    }

    pub fn removals_applied(&self) -> u64 {
        self.removals_applied.load(Ordering::Relaxed)
    }

    pub fn verify_cycles(&self) -> u64 {
        self.verify_cycles.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Outcome of one verification cycle: how many checksum broadcasts were
/// attempted and how they fared. Doubles as a convergence signal for tests.
pub struct VerifyRecord {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}
