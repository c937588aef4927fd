//! Cluster configuration.

use crate::error::{ClusterError, ClusterResult};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's unique ID in the cluster (1-based).
    pub node_id: NodeId,

    /// Address this node listens on for Raft RPC (e.g., "0.0.0.0:4002").
    pub listen_addr: String,

    /// Raft address advertised to other nodes. Falls back to `listen_addr`.
    pub advertise_addr: Option<String>,

    /// Address of the client-facing API, published as node metadata.
    pub api_addr: String,

    /// API address advertised to other nodes. Falls back to `api_addr`.
    pub api_advertise_addr: Option<String>,

    /// Directory for the Raft log and snapshots.
    pub data_dir: PathBuf,

    /// Raft timing configuration.
    pub raft: RaftConfig,

    /// Snapshot configuration.
    pub snapshot: SnapshotConfig,

    /// Command submission and startup waits.
    pub store: StoreConfig,

    /// How to join an existing cluster.
    pub join: JoinConfig,
}

/// Raft timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Election timeout range (min, max) in milliseconds.
    /// A random value in this range is chosen for each election.
    pub election_timeout_ms: (u64, u64),

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: u64,
}

/// Snapshot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot once this many entries were applied since the last one.
    pub threshold: u64,

    /// How often to check the threshold, in milliseconds.
    pub interval_ms: u64,

    /// Snapshot files kept on disk.
    pub retained: usize,
}

/// Command submission and startup waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Longest wait for a submitted command to apply, in milliseconds.
    pub apply_timeout_ms: u64,

    /// Longest wait for a leader and for the log to catch up at startup,
    /// in milliseconds. Zero skips the applied-index wait.
    pub open_timeout_ms: u64,

    /// Whether a missing leader after `open_timeout_ms` is fatal.
    pub leader_wait: bool,

    /// Payloads at least this large are compressed. Zero disables it.
    pub compression_size: usize,
}

/// How to join an existing cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Cluster service addresses to try, in order.
    pub peers: Vec<String>,

    /// Rounds over `peers` before giving up.
    pub attempts: u32,

    /// Pause between rounds, in milliseconds.
    pub interval_ms: u64,

    /// Source IP reported to the peer.
    pub source_ip: Option<String>,

    /// Join as a voter (`false` joins as a learner).
    pub voter: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:4002".to_string(),
            advertise_addr: None,
            api_addr: "127.0.0.1:4001".to_string(),
            api_advertise_addr: None,
            data_dir: PathBuf::from("./warden-data"),
            raft: RaftConfig::default(),
            snapshot: SnapshotConfig::default(),
            store: StoreConfig::default(),
            join: JoinConfig::default(),
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: (150, 300),
            heartbeat_interval_ms: 50,
            max_entries_per_append: 300,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            threshold: 8192,
            interval_ms: 30_000,
            retained: 2,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            apply_timeout_ms: 10_000,
            open_timeout_ms: 120_000,
            leader_wait: true,
            compression_size: 150,
        }
    }
}

impl JoinConfig {
    /// Defaults used when join peers are given without retry settings.
    pub fn with_peers(peers: Vec<String>) -> Self {
        Self {
            peers,
            attempts: 5,
            interval_ms: 5_000,
            source_ip: None,
            voter: true,
        }
    }

    /// Pause between join rounds.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ClusterConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Get the advertised Raft address (falls back to listen_addr).
    pub fn advertise_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.listen_addr)
    }

    /// Get the advertised API address (falls back to api_addr).
    pub fn api_advertise_addr(&self) -> &str {
        self.api_advertise_addr.as_deref().unwrap_or(&self.api_addr)
    }

    /// Directory holding the Raft log.
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    /// Get the heartbeat interval as a Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.raft.heartbeat_interval_ms)
    }

    /// Longest wait for a submitted command.
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.store.apply_timeout_ms)
    }

    /// Longest startup wait.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.store.open_timeout_ms)
    }

    /// Snapshot threshold check interval.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot.interval_ms)
    }

    /// Build the openraft configuration.
    ///
    /// Automatic log-count snapshots are disabled: snapshots are triggered by
    /// the interval task so the threshold is checked on a fixed cadence.
    pub fn openraft_config(&self) -> ClusterResult<openraft::Config> {
        let (min, max) = self.raft.election_timeout_ms;
        let config = openraft::Config {
            cluster_name: "warden".to_string(),
            heartbeat_interval: self.raft.heartbeat_interval_ms,
            election_timeout_min: min,
            election_timeout_max: max,
            max_payload_entries: self.raft.max_entries_per_append,
            snapshot_policy: openraft::SnapshotPolicy::Never,
            max_in_snapshot_log_to_keep: self.snapshot.threshold.min(1000),
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| ClusterError::Config(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ClusterResult<()> {
        let invalid = |msg: String| Err(ClusterError::Config(msg));

        if self.node_id == 0 {
            return invalid("node_id must be > 0".to_string());
        }
        if self.listen_addr.is_empty() {
            return invalid("listen_addr is required".to_string());
        }

        let (min_election, max_election) = self.raft.election_timeout_ms;
        if min_election >= max_election {
            return invalid(format!(
                "election timeout range ({min_election}, {max_election}) is empty"
            ));
        }
        if self.raft.heartbeat_interval_ms >= min_election / 2 {
            return invalid(format!(
                "heartbeat_interval_ms ({}) should be << election_timeout_ms ({})",
                self.raft.heartbeat_interval_ms, min_election
            ));
        }
        if self.snapshot.interval_ms == 0 {
            return invalid("snapshot interval must be > 0".to_string());
        }
        if !self.join.peers.is_empty() && self.join.attempts == 0 {
            return invalid("join attempts must be > 0 when join peers are set".to_string());
        }

        Ok(())
    }
}

/// Builder for ClusterConfig.
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Set the node ID.
    pub fn node_id(mut self, id: NodeId) -> Self {
        self.config.node_id = id;
        self
    }

    /// Set the Raft listen address.
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the advertised Raft address.
    pub fn advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.advertise_addr = Some(addr.into());
        self
    }

    /// Set the API address.
    pub fn api_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.api_addr = addr.into();
        self
    }

    /// Set the advertised API address.
    pub fn api_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.api_advertise_addr = Some(addr.into());
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set election timeout range in milliseconds.
    pub fn election_timeout_ms(mut self, min: u64, max: u64) -> Self {
        self.config.raft.election_timeout_ms = (min, max);
        self
    }

    /// Set heartbeat interval in milliseconds.
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.raft.heartbeat_interval_ms = ms;
        self
    }

    /// Set snapshot threshold.
    pub fn snapshot_threshold(mut self, entries: u64) -> Self {
        self.config.snapshot.threshold = entries;
        self
    }

    /// Set snapshot check interval in milliseconds.
    pub fn snapshot_interval_ms(mut self, ms: u64) -> Self {
        self.config.snapshot.interval_ms = ms;
        self
    }

    /// Set apply timeout in milliseconds.
    pub fn apply_timeout_ms(mut self, ms: u64) -> Self {
        self.config.store.apply_timeout_ms = ms;
        self
    }

    /// Set startup wait in milliseconds.
    pub fn open_timeout_ms(mut self, ms: u64) -> Self {
        self.config.store.open_timeout_ms = ms;
        self
    }

    /// Set whether a missing leader at startup is fatal.
    pub fn leader_wait(mut self, fatal: bool) -> Self {
        self.config.store.leader_wait = fatal;
        self
    }

    /// Set the payload compression threshold in bytes.
    pub fn compression_size(mut self, bytes: usize) -> Self {
        self.config.store.compression_size = bytes;
        self
    }

    /// Set the join configuration.
    pub fn join(mut self, join: JoinConfig) -> Self {
        self.config.join = join;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClusterResult<ClusterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
