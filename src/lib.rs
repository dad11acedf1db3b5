// Copyright (c) 2025 Quilt Foundation

//! Gossip-based dissemination of keyed metadata over an ad-hoc
//! peer-to-peer overlay.
//!
//! Nodes of a Quilt cluster use this crate to share small, keyed pieces of
//! metadata (membership, load, liveness, routing hints) so that
//! information from the furthest node reaches any other node in a bounded
//! number of hops while total traffic stays proportional to the number of
//! nodes. Gossiped information is identified by key and captured by
//! [`Info`] records; related records can be grouped under a key prefix
//! with a bound on total set size, so per-node statistics cannot swamp the
//! network in a large cluster.
//!
//! # Joining and staying joined
//!
//! Every node runs the same loop:
//!
//! 1. Start the gossip server to accept incoming pulls.
//! 2. Pick a random peer from the bootstrap list (excluding yourself) and
//!    start a client to it.
//! 3. The client repeatedly requests everything past its high-water mark.
//!    The first request is an initial probe and is answered immediately;
//!    later requests long-poll. A client that times out, is redirected, or
//!    sees nothing new for too long is closed and reaped.
//! 4. Periodically, the manage loop measures graph tightness: records
//!    arriving from beyond the tolerated hop ceiling name origins worth
//!    dialling directly. With room in the outgoing set a client is started
//!    immediately; otherwise the least useful peer is closed to make room.
//! 5. If the node has no outgoing peers, or the sentinel key has expired
//!    (the node is likely partitioned), the bootstrap loop wakes and dials
//!    back in.
//!
//! A server with a full house of incoming peers answers new requesters
//! with a redirect to one of its connected peers rather than serving them.
//!
//! # Usage
//!
//! ```ignore
//! use quilt_gossip::{Gossip, GossipConfigBuilder, GroupKind};
//! use std::time::Duration;
//!
//! let config = GossipConfigBuilder::new()
//!     .bootstrap_list("node-b:7610,node-c:7610")
//!     .gossip_interval(Duration::from_secs(2))
//!     .build();
//!
//! let mut gossip = Gossip::new("0.0.0.0:7610", config);
//! gossip.start().await?;
//!
//! gossip.register_group("load.", 100, GroupKind::Min)?;
//! gossip.add_float64("load.node-a", 0.71, Duration::from_secs(30))?;
//!
//! if let Ok(count) = gossip.get_int64("nodeCount") {
//!     println!("cluster size: {count}");
//! }
//!
//! gossip.close().await;
//! ```

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod addr_set;
pub mod client;
pub mod config;
pub mod error;
pub mod group;
pub mod info;
pub mod messages;
pub mod server;
pub mod service;
pub mod store;
pub mod transport;

// Re-export main types for convenience
pub use addr_set::AddrSet;
pub use config::{GossipConfig, GossipConfigBuilder};
pub use error::{GossipError, GossipResult};
pub use group::{Group, GroupKind};
pub use info::{Info, Value};
pub use messages::{GossipRequest, GossipResponse};
pub use service::Gossip;
pub use store::InfoStore;

/// Maximum number of connected gossip peers, in each direction.
pub const MAX_PEERS: usize = 10;

/// Sentinel gossip key. If it is missing or expired the node considers
/// itself partitioned and re-bootstraps.
pub const SENTINEL_KEY: &str = "meta0";

/// Key under which the cluster's node count is gossiped, as an int64.
pub const NODE_COUNT_KEY: &str = "nodeCount";

/// Node count assumed until [`NODE_COUNT_KEY`] is gossiped. Set high on
/// purpose, to avoid tightening the graph prematurely while the network is
/// still assembling.
pub const DEFAULT_NODE_COUNT: i64 = 1000;
