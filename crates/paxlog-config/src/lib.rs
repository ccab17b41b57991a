//! Configuration management for paxlog
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (PAXLOG_* prefix, highest precedence)
//! 2. paxlog.local.toml (gitignored, local overrides)
//! 3. paxlog.toml (git-tracked, project config)
//! 4. ~/.config/paxlog/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main paxlog configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PaxlogConfig {
    pub node: NodeConfig,
    pub peers: Vec<PeerConfig>,
    pub paxos: PaxosConfig,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
}

impl Default for PaxlogConfig {
    fn default() -> Self {
        let node = NodeConfig::default();
        let peers = vec![PeerConfig {
            id: node.id,
            address: node.listen.clone(),
        }];
        Self {
            node,
            peers,
            paxos: PaxosConfig::default(),
            transport: TransportConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    /// Index of this node in the peer group.
    pub id: u8,
    pub listen: String,
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            listen: "127.0.0.1:7400".to_string(),
            data_dir: PathBuf::from(".paxlog/data"),
        }
    }
}

/// One member of the peer group. The local node may be listed too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: u8,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PaxosConfig {
    /// Rounds a proposer keeps open at once.
    pub pipeline_depth: usize,
    /// Submitted values waiting for a round.
    pub pending_capacity: usize,
    pub round_timeout_ms: u64,
    pub max_backoff_ms: u64,
    /// Apply stall after which missing SCNs are filled.
    pub gap_timeout_ms: u64,
    pub tick_ms: u64,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 8,
            pending_capacity: 1024,
            round_timeout_ms: 500,
            max_backoff_ms: 5000,
            gap_timeout_ms: 2000,
            tick_ms: 50,
        }
    }
}

impl PaxosConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Messages queued per peer link before new ones are dropped.
    pub output_queue_depth: usize,
    /// Frames coalesced into one socket write.
    pub flush_batch: usize,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            output_queue_depth: 1024,
            flush_batch: 64,
            reconnect_min_ms: 100,
            reconnect_max_ms: 5000,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// fsync the paxos log after every record.
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { sync_writes: true }
    }
}

impl PaxlogConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.node.data_dir.is_relative() {
            self.node.data_dir = base.join(&self.node.data_dir);
        }
    }

    /// Checks the settings a node cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.is_empty() {
            return Err(ConfigError::NoPeers);
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return Err(ConfigError::DuplicatePeer(peer.id));
            }
        }
        if !seen.contains(&self.node.id) {
            return Err(ConfigError::LocalNotInPeers(self.node.id));
        }

        let positive = [
            ("paxos.pipeline_depth", self.paxos.pipeline_depth as u64),
            ("paxos.pending_capacity", self.paxos.pending_capacity as u64),
            ("paxos.round_timeout_ms", self.paxos.round_timeout_ms),
            ("paxos.tick_ms", self.paxos.tick_ms),
            ("transport.output_queue_depth", self.transport.output_queue_depth as u64),
            ("transport.flush_batch", self.transport.flush_batch as u64),
            ("transport.reconnect_min_ms", self.transport.reconnect_min_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        if self.paxos.max_backoff_ms < self.paxos.round_timeout_ms {
            return Err(ConfigError::Invalid {
                field: "paxos.max_backoff_ms",
                reason: "must not be below round_timeout_ms".to_string(),
            });
        }
        if self.transport.reconnect_max_ms < self.transport.reconnect_min_ms {
            return Err(ConfigError::Invalid {
                field: "transport.reconnect_max_ms",
                reason: "must not be below reconnect_min_ms".to_string(),
            });
        }

        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
