// Copyright (c) 2025 Quilt Foundation

//! Configuration for a gossip instance.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a gossip node.
///
/// Two knobs drive everything else: the bootstrap list and the gossip
/// interval. The request timeout, the new-gossip patience, and the server's
/// jittered reply schedule are all derived from the interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Endpoints (`host:port`) used to join the gossip network. The node's
    /// own address is filtered out at startup; an empty remainder is fatal.
    pub bootstrap: Vec<String>,

    /// Approximate interval at which peers exchange new information.
    pub gossip_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            gossip_interval: Duration::from_secs(2),
        }
    }
}

impl GossipConfig {
    /// Deadline for a single request/response exchange. The server may sit
    /// on a request for up to ~1.5 intervals, so allow two.
    pub fn request_timeout(&self) -> Duration {
        self.gossip_interval * 2
    }

    /// How long a client tolerates receiving nothing new before it closes
    /// its session to make room for a more useful peer.
    pub fn max_wait_for_new_gossip(&self) -> Duration {
        self.gossip_interval * 60
    }

    /// The gossip interval jittered uniformly over `[0.5, 1.5)` of itself,
    /// so the network's pull schedules decorrelate.
    pub fn jittered_interval(&self) -> Duration {
        self.gossip_interval
            .mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

/// Builder for [`GossipConfig`].
#[derive(Debug, Default)]
pub struct GossipConfigBuilder {
    config: GossipConfig,
}

impl GossipConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bootstrap endpoints.
    pub fn bootstrap(mut self, addrs: Vec<String>) -> Self {
        self.config.bootstrap = addrs;
        self
    }

    /// Add a single bootstrap endpoint.
    pub fn add_bootstrap(mut self, addr: impl Into<String>) -> Self {
        self.config.bootstrap.push(addr.into());
        self
    }

    /// Set bootstrap endpoints from a comma-separated `host:port` list,
    /// trimming whitespace and skipping empty entries.
    pub fn bootstrap_list(mut self, list: &str) -> Self {
        self.config.bootstrap = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    /// Set the gossip interval.
    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.config.gossip_interval = interval;
        self
    }

    /// Build the config.
    pub fn build(self) -> GossipConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GossipConfig::default();
        assert!(config.bootstrap.is_empty());
        assert_eq!(config.gossip_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_derived_durations() {
        let config = GossipConfigBuilder::new()
            .gossip_interval(Duration::from_millis(100))
            .build();
        assert_eq!(config.request_timeout(), Duration::from_millis(200));
        assert_eq!(config.max_wait_for_new_gossip(), Duration::from_secs(6));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = GossipConfig::default();
        for _ in 0..64 {
            let jittered = config.jittered_interval();
            assert!(jittered >= config.gossip_interval / 2);
            assert!(jittered <= config.gossip_interval * 3 / 2);
        }
    }

    #[test]
    fn test_bootstrap_list_parsing() {
        let config = GossipConfigBuilder::new()
            .bootstrap_list(" node-a:9000, node-b:9000 ,,node-c:9000 ")
            .build();
        assert_eq!(
            config.bootstrap,
            vec!["node-a:9000", "node-b:9000", "node-c:9000"]
        );
    }

    #[test]
    fn test_builder() {
        let config = GossipConfigBuilder::new()
            .add_bootstrap("node-a:9000")
            .add_bootstrap("node-b:9000")
            .gossip_interval(Duration::from_secs(1))
            .build();
        assert_eq!(config.bootstrap.len(), 2);
        assert_eq!(config.gossip_interval, Duration::from_secs(1));
    }
}
