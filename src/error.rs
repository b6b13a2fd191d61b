use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::core::DataOperation;

#[derive(Debug, Error)]
pub enum DistroError {
    #[error("no components registered for resource type {0:?}")]
    /// A sync/verify/pull referenced a resource type nothing was registered
    /// for. This is a configuration error and is surfaced immediately rather
    /// than swallowed.
    UnregisteredType(String),

    #[error("operation {0} cannot be synchronised")]
    /// Only mutations (add/change/delete) may be handed to `sync`.
    InvalidOperation(DataOperation),

    #[error(transparent)]
    /// A network call to a peer failed. Transient; retried internally and
    /// repaired by the verification cycle, never escalated past the engine.
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("processor rejected data: {0}")]
    Processor(#[source] anyhow::Error),

    #[error("the replication engine is not running")]
    /// The protocol has not been started yet, or is shutting down.
    NotRunning,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {0} timed out after {1:?}")]
    Timeout(SocketAddr, Duration),

    #[error("peer {0} is unreachable")]
    Unreachable(SocketAddr),

    #[error("remote error: {0}")]
    Remote(String),
}
