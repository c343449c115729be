//! Service configuration.
use std::collections::HashSet;

use localtime::LocalDuration;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hard ceiling on peers with connections. Beyond it, signalling
    /// requests from unconnected peers are rejected as congested.
    pub max_peers: usize,
    /// Number of connected peers we aim for. New dials to disconnected
    /// peers are refused above it.
    pub target_peers: usize,
    /// How often to gossip the connected-peer list.
    pub broadcast_interval: LocalDuration,
    /// How often to sweep for disposable peer records.
    pub dispose_interval: LocalDuration,
    /// Longest accepted peer name, in characters.
    pub name_max_len: usize,
    /// Addresses exempt from dial cooldowns.
    pub whitelist: HashSet<String>,
    /// Whether this node is a worker. Workers don't participate in gossip.
    pub is_worker: bool,
    /// Whether to include worker peers in peer-list broadcasts.
    pub broadcast_workers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 10_000,
            target_peers: 50,
            broadcast_interval: LocalDuration::from_secs(5),
            dispose_interval: LocalDuration::from_secs(2),
            name_max_len: 32,
            whitelist: HashSet::new(),
            is_worker: false,
            broadcast_workers: false,
        }
    }
}

impl Config {
    pub fn is_whitelisted(&self, address: &str) -> bool {
        self.whitelist.contains(address)
    }
}
