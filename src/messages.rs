// Copyright (c) 2025 Quilt Foundation

//! Wire messages for the gossip pull protocol.
//!
//! A session is a sequence of request/response exchanges over one TCP
//! connection, with at most one request in flight: the client asks for
//! everything past its high-water mark, and the server answers (possibly
//! after a jittered delay, possibly with an empty delta) or redirects a
//! surplus client to another peer.

use crate::info::Info;
use serde::{Deserialize, Serialize};

/// A pull request: "send me records with seq greater than `max_seq`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipRequest {
    /// The requester's advertised gossip endpoint. The TCP source address
    /// carries an ephemeral port, so the requester must name itself.
    pub addr: String,

    /// High-water mark of the responder's sequence numbers seen so far.
    /// Negative on the initial probe, which is answered immediately with
    /// the full delta.
    pub max_seq: i64,
}

/// A pull response: the delta, or a redirect when the responder is full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipResponse {
    /// Records with seq past the requested high-water mark, ascending by
    /// seq. Empty responses are valid; they keep the client from timing
    /// out.
    pub delta: Vec<Info>,

    /// Set when the responder has no room for this peer: the address of an
    /// already-connected peer to try instead.
    pub forward_addr: Option<String>,
}
