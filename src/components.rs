use std::net::SocketAddr;

use async_trait::async_trait;

use crate::core::{DataOperation, DistroData, DistroKey, VerifyData, VerifyDiff};
use crate::error::TransportError;

/// Supplies this node's authoritative content for one resource type.
///
/// Implemented by the registry layer sitting above the engine; the engine
/// reads through it when pushing, verifying and serving pulls, and never
/// caches the results.
#[async_trait]
pub trait DataStorage: Send + Sync + 'static {
    /// Every datum currently held for this resource type.
    async fn get_datum_snapshot(&self) -> Result<Vec<DistroData>, anyhow::Error>;

    /// The current content for one key, or `None` if it no longer exists.
    async fn get_distro_data(&self, key: &DistroKey)
        -> Result<Option<DistroData>, anyhow::Error>;
}

/// Applies inbound replicated data to the real registry store.
#[async_trait]
pub trait DataProcessor: Send + Sync + 'static {
    /// The resource type this processor handles.
    fn process_type(&self) -> &str;

    /// Applies a pushed mutation. Must be idempotent: re-applying the same
    /// data leaves the store unchanged.
    async fn process_data(&self, data: DistroData) -> Result<(), anyhow::Error>;

    /// Compares a received checksum batch against the local view and returns
    /// the keys that disagree. A mismatch is not an error, it is the trigger
    /// for reconciliation.
    async fn process_verify_data(&self, data: &VerifyData) -> Result<VerifyDiff, anyhow::Error>;

    /// Applies authoritative content obtained through a pull.
    async fn process_snapshot(&self, data: DistroData) -> Result<(), anyhow::Error>;
}

/// The actual network sends for one resource type, implemented atop the
/// environment's RPC layer.
///
/// All calls are awaited inside worker lanes with a timeout applied by the
/// engine; implementations only need to surface the outcome.
#[async_trait]
pub trait TransportAgent: Send + Sync + 'static {
    /// Pushes one datum to a peer.
    async fn sync_data(&self, target: SocketAddr, data: DistroData)
        -> Result<(), TransportError>;

    /// Sends a checksum batch to a peer as part of the verification cycle.
    async fn sync_verify_data(
        &self,
        target: SocketAddr,
        data: VerifyData,
    ) -> Result<(), TransportError>;

    /// Pulls the authoritative content for one key from a peer.
    async fn get_data(
        &self,
        target: SocketAddr,
        key: DistroKey,
    ) -> Result<DistroData, TransportError>;

    /// Pulls a peer's full snapshot for this agent's resource type.
    async fn get_datum_snapshot(
        &self,
        target: SocketAddr,
    ) -> Result<Vec<DistroData>, TransportError>;
}

/// Per-type policy for re-attempting a failed push.
///
/// When no handler is registered for a type the engine falls back to its own
/// bounded exponential backoff through the delay queue.
#[async_trait]
pub trait FailedTaskHandler: Send + Sync + 'static {
    /// Called after a send failed. `attempts` counts this failure.
    async fn retry(&self, key: DistroKey, operation: DataOperation, attempts: u32);
}
