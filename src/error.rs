// Copyright (c) 2025 Quilt Foundation

//! Error types for the gossip crate.

use displaydoc::Display;
use thiserror::Error;

/// Errors that can occur in the gossip subsystem.
#[derive(Debug, Display, Error)]
pub enum GossipError {
    /// key {0:?} does not exist or has expired
    KeyNotFound(String),

    /// value for key {0:?} is not of the requested type
    TypeMismatch(String),

    /// no group registered for prefix {0:?}
    GroupUnknown(String),

    /// group {0:?} is already registered
    GroupExists(String),

    /// group {0:?} overlaps an existing group prefix
    GroupConflict(String),

    /// info {0:?} did not make the cut for its group
    GroupFull(String),

    /// info {0:?} is not newer than the stored info
    Stale(String),

    /// transport failure: {0}
    Transport(String),

    /// failed to encode or decode a gossip frame: {0}
    Codec(String),

    /// timed out waiting for a gossip response
    Timeout,

    /// no addresses available for gossip bootstrap
    BootstrapEmpty,

    /// gossip instance is closed
    Closed,
}

impl From<std::io::Error> for GossipError {
    fn from(err: std::io::Error) -> Self {
        GossipError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for GossipError {
    fn from(err: serde_json::Error) -> Self {
        GossipError::Codec(err.to_string())
    }
}

/// Result type for gossip operations.
pub type GossipResult<T> = Result<T, GossipError>;
