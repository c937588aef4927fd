//! Serve command - run a Warden node.
//!
//! Startup order: detect previous node state, open the store (bootstrapping
//! only a brand-new node with nothing to join), join through the given peers,
//! wait for a leader and for the local log to be applied, publish this
//! node's API address, then serve until interrupted.

use anyhow::{Context, Result, bail};
use clap::Args;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use warden_cluster::config::{JoinConfig, RaftConfig, SnapshotConfig, StoreConfig};
use warden_cluster::raft::{API_ADDR_KEY, API_PROTO_KEY};
use warden_cluster::{ClusterConfig, ClusterError, Store};

/// Protocol published for the client API.
const API_PROTO: &str = "grpc";

/// Flags for `warden serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Directory holding the Raft log and snapshots
    pub data_dir: PathBuf,

    /// Unique numeric ID of this node
    #[arg(long, env = "WARDEN_NODE_ID")]
    pub node_id: u64,

    /// Client API bind address
    #[arg(long, default_value = "127.0.0.1:4001")]
    pub http_addr: String,

    /// Advertised client API address. If not set, same as the bind address
    #[arg(long)]
    pub http_adv_addr: Option<String>,

    /// Raft communication bind address
    #[arg(long, default_value = "127.0.0.1:4002")]
    pub raft_addr: String,

    /// Advertised Raft address. If not set, same as the bind address
    #[arg(long)]
    pub raft_adv_addr: Option<String>,

    /// Comma-delimited list of nodes through which a cluster can be joined
    #[arg(long, value_delimiter = ',')]
    pub join: Vec<String>,

    /// Number of join attempts to make
    #[arg(long, default_value_t = 5)]
    pub join_attempts: u32,

    /// Period between join attempts
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub join_interval: Duration,

    /// Source IP address reported during join requests
    #[arg(long)]
    pub join_source_ip: Option<String>,

    /// Configure as non-voting node
    #[arg(long)]
    pub raft_non_voter: bool,

    /// Number of applied log entries that trigger a snapshot
    #[arg(long, default_value_t = 8192)]
    pub raft_snap: u64,

    /// Snapshot threshold check interval
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub raft_snap_int: Duration,

    /// Time without leader contact before a follower campaigns; heartbeats
    /// are sent ten times per period
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub raft_timeout: Duration,

    /// Minimum election timeout; the maximum is twice this value
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub raft_election_timeout: Duration,

    /// Time to wait for a command to be applied
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub raft_apply_timeout: Duration,

    /// Time for initial Raft logs to be applied. Use 0s to skip the wait
    #[arg(long, default_value = "120s", value_parser = humantime::parse_duration)]
    pub raft_open_timeout: Duration,

    /// Fail startup if no leader appears within the open timeout
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub raft_leader_wait: bool,

    /// Payload size in bytes from which commands are compressed
    #[arg(long, default_value_t = 150)]
    pub compression_size: usize,
}

impl ServeArgs {
    /// Translate flags into a validated cluster configuration.
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let election_ms = millis(self.raft_election_timeout, "--raft-election-timeout")?;
        let election_max_ms = election_ms
            .checked_mul(2)
            .context("--raft-election-timeout is too large")?;
        let heartbeat_ms = (millis(self.raft_timeout, "--raft-timeout")? / 10).max(1);

        let config = ClusterConfig {
            node_id: self.node_id,
            listen_addr: self.raft_addr.clone(),
            advertise_addr: self.raft_adv_addr.clone(),
            api_addr: self.http_addr.clone(),
            api_advertise_addr: self.http_adv_addr.clone(),
            data_dir: self.data_dir.clone(),
            raft: RaftConfig {
                election_timeout_ms: (election_ms, election_max_ms),
                heartbeat_interval_ms: heartbeat_ms,
                ..RaftConfig::default()
            },
            snapshot: SnapshotConfig {
                threshold: self.raft_snap,
                interval_ms: millis(self.raft_snap_int, "--raft-snap-int")?,
                ..SnapshotConfig::default()
            },
            store: StoreConfig {
                apply_timeout_ms: millis(self.raft_apply_timeout, "--raft-apply-timeout")?,
                open_timeout_ms: millis(self.raft_open_timeout, "--raft-open-timeout")?,
                leader_wait: self.raft_leader_wait,
                compression_size: self.compression_size,
            },
            join: JoinConfig {
                peers: self.join.clone(),
                attempts: self.join_attempts,
                interval_ms: millis(self.join_interval, "--join-interval")?,
                source_ip: self.join_source_ip.clone(),
                voter: !self.raft_non_voter,
            },
        };
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn millis(duration: Duration, flag: &str) -> Result<u64> {
    u64::try_from(duration.as_millis())
        .with_context(|| format!("{flag} {duration:?} is out of range"))
}

/// Run the serve command.
pub async fn run(args: ServeArgs) -> Result<()> {
    let config = args.cluster_config()?;
    let api_addr: SocketAddr = config
        .api_addr
        .parse()
        .with_context(|| format!("invalid API address {}", config.api_addr))?;

    let is_new = Store::is_new_node(&config.data_dir);
    if is_new {
        tracing::info!(data_dir = %config.data_dir.display(), "no preexisting node state, node may be bootstrapping");
    } else {
        tracing::info!(data_dir = %config.data_dir.display(), "preexisting node state detected");
    }

    let joins = !config.join.peers.is_empty();
    if joins {
        tracing::info!(peers = ?config.join.peers, "join addresses specified, node is not bootstrapping");
        if !is_new {
            tracing::info!("node is already member of cluster, ignoring join addresses");
        }
    }
    let bootstrap = is_new && !joins;

    let meta = BTreeMap::from([
        (
            API_ADDR_KEY.to_string(),
            config.api_advertise_addr().to_string(),
        ),
        (API_PROTO_KEY.to_string(), API_PROTO.to_string()),
    ]);
    let open_timeout = config.open_timeout();
    let leader_wait = config.store.leader_wait;

    let store = Store::open(config, bootstrap)
        .await
        .context("failed to open store")?;

    if joins && is_new {
        let accepted = store
            .join_cluster(meta.clone())
            .await
            .context("failed to join cluster")?;
        tracing::info!(peer = %accepted, "successfully joined cluster");
    }

    wait_for_consensus(&store, open_timeout, leader_wait).await?;

    match store.set_metadata(meta).await {
        Ok(()) => {}
        // Metadata arrives through the join on followers.
        Err(ClusterError::NotLeader { .. }) => {}
        Err(e) => return Err(e).context("failed to set store metadata"),
    }

    tracing::info!(node_id = store.node_id(), "node is ready");
    let result = store.serve_api(api_addr, shutdown_signal()).await;

    if let Err(e) = store.shutdown().await {
        tracing::warn!(error = %e, "failed to close store");
    }
    result.context("client API server failed")?;

    tracing::info!("warden server stopped");
    Ok(())
}

async fn wait_for_consensus(store: &Store, open_timeout: Duration, leader_wait: bool) -> Result<()> {
    if let Err(e) = store.wait_for_leader(open_timeout).await {
        if leader_wait {
            bail!("leader did not appear within timeout: {e}");
        }
        tracing::warn!("ignoring error while waiting for leader");
    }

    if open_timeout.is_zero() {
        tracing::info!("not waiting for logs to be applied");
        return Ok(());
    }
    store
        .wait_for_applied(open_timeout)
        .await
        .context("log was not fully applied within timeout")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
