//! Store - the main entry point for cluster operations.

use crate::command::{
    Command, CommandKind, EnforcePayload, PoliciesPayload, ReadConsistency,
    RemoveFilteredPolicyPayload, SetModelPayload, UpdatePoliciesPayload, UpdatePolicyPayload,
};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::join::JoinCoordinator;
use crate::network::{NetworkClient, RaftServer};
use crate::proto::cluster_service_server::ClusterServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::log_store::LogStore;
use crate::raft::ticker::SnapshotTicker;
use crate::service::ClusterServiceImpl;
use crate::state::{ClusterMetadata, NodeMetadata, StateMachineStore, StoreResponse};
use crate::types::{
    LeaderInfo, NodeId, WardenMetrics, WardenRaft, WardenRaftWriteError, forward_to_leader,
};
use openraft::error::{InitializeError, RaftError};
use openraft::{BasicNode, ChangeMembers, Raft, ServerState};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tonic::transport::Server;
use warden_core::{MatcherEvaluator, PolicyEvaluator};

/// Metadata key holding a node's client API address.
pub const API_ADDR_KEY: &str = "api_addr";

/// Metadata key holding a node's client API protocol.
pub const API_PROTO_KEY: &str = "api_proto";

/// Result of submitting a command to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The command was committed and applied. The response may still carry
    /// a request-level error.
    Committed(StoreResponse),

    /// This node is not the leader. Nothing was proposed.
    NotLeader {
        /// The current leader if known.
        leader: Option<NodeId>,
        /// The leader's raft address (empty if unknown).
        leader_addr: String,
    },

    /// The wait ended first. The command may still be applied later.
    TimedOut,
}

impl ApplyOutcome {
    /// Turn redirects and timeouts into errors.
    pub fn into_response(self) -> ClusterResult<StoreResponse> {
        match self {
            ApplyOutcome::Committed(response) => Ok(response),
            ApplyOutcome::NotLeader {
                leader,
                leader_addr,
            } => Err(ClusterError::NotLeader {
                leader,
                leader_addr,
            }),
            ApplyOutcome::TimedOut => Err(ClusterError::timeout("command to apply")),
        }
    }
}

/// A cluster member as seen in the current membership config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    /// Node ID.
    pub node_id: NodeId,
    /// Raft address.
    pub address: String,
    /// Whether the node votes.
    pub voter: bool,
}

/// Point-in-time view of this node.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// This node's ID.
    pub node_id: NodeId,
    /// Raft role.
    pub state: &'static str,
    /// Current leader if known.
    pub leader_id: Option<NodeId>,
    /// Current term.
    pub term: u64,
    /// Index of the last local log entry.
    pub last_log_index: u64,
    /// Index of the last applied entry.
    pub last_applied: u64,
    /// Index covered by the last snapshot.
    pub snapshot_index: u64,
    /// Namespaces on this replica.
    pub namespaces: usize,
    /// Current members.
    pub members: Vec<MemberInfo>,
    /// API addresses published through node metadata.
    pub api_addrs: BTreeMap<NodeId, String>,
}

#[derive(Default)]
struct Background {
    server_shutdown: Option<oneshot::Sender<()>>,
    ticker: Option<Arc<SnapshotTicker>>,
}

/// A node of the Warden cluster.
///
/// Owns the Raft instance, the state machine, the gRPC server for peer
/// traffic and the snapshot ticker. Cloning is cheap; clones share one node.
#[derive(Clone)]
pub struct Store {
    node_id: NodeId,
    config: Arc<ClusterConfig>,
    raft: Arc<WardenRaft>,
    state_machine: Arc<StateMachineStore>,
    background: Arc<Mutex<Background>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("node_id", &self.node_id)
            .field("listen_addr", &self.config.listen_addr)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Whether `data_dir` holds no previous node state.
    pub fn is_new_node(data_dir: &Path) -> bool {
        !LogStore::exists(&data_dir.join("raft"))
    }

    /// Open the store with the default matcher evaluator.
    ///
    /// With `bootstrap` set, a single-node cluster containing this node is
    /// initialized. Bootstrapping an already initialized node is a no-op.
    pub async fn open(config: ClusterConfig, bootstrap: bool) -> ClusterResult<Self> {
        Self::open_with_evaluator(config, bootstrap, Arc::new(MatcherEvaluator::new())).await
    }

    /// Open the store with a custom policy evaluator.
    pub async fn open_with_evaluator(
        config: ClusterConfig,
        bootstrap: bool,
        evaluator: Arc<dyn PolicyEvaluator>,
    ) -> ClusterResult<Self> {
        config.validate()?;
        let node_id = config.node_id;

        let raft_dir = config.raft_dir();
        let data_dir = config.data_dir.clone();
        let retained = config.snapshot.retained;
        let (log_store, state_machine) = tokio::task::spawn_blocking(move || {
            let log_store = LogStore::open(raft_dir)?;
            let state_machine = StateMachineStore::open(&data_dir, retained, evaluator)?;
            Ok::<_, ClusterError>((log_store, state_machine))
        })
        .await
        .map_err(|e| ClusterError::Storage(format!("failed to load node state: {e}")))??;
        let state_machine = Arc::new(state_machine);
        let raft_config = Arc::new(config.openraft_config()?);

        let raft = Raft::new(
            node_id,
            raft_config,
            NetworkClient::new(),
            log_store,
            Arc::clone(&state_machine),
        )
        .await
        .map_err(|e| ClusterError::Storage(format!("failed to create raft: {e}")))?;

        let store = Self {
            node_id,
            config: Arc::new(config),
            raft: Arc::new(raft),
            state_machine,
            background: Arc::new(Mutex::new(Background::default())),
        };

        store.spawn_server()?;
        store.spawn_ticker();

        if bootstrap {
            store.initialize().await?;
        }

        tracing::info!(
            node_id,
            addr = %store.config.listen_addr,
            data_dir = %store.config.data_dir.display(),
            bootstrap,
            "store opened"
        );
        Ok(store)
    }

    /// Serve the Raft and cluster services on the listen address.
    fn spawn_server(&self) -> ClusterResult<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ClusterError::Config(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let raft_server = RaftServer::new(Arc::clone(&self.raft));
        let cluster_server = ClusterServiceImpl::new(self.clone());
        let node_id = self.node_id;

        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(RaftServiceServer::new(raft_server))
                .add_service(ClusterServiceServer::new(cluster_server))
                .serve_with_shutdown(addr, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(node_id, %addr, error = %e, "raft server failed");
            }
        });

        self.background.lock().server_shutdown = Some(shutdown_tx);
        Ok(())
    }

    fn spawn_ticker(&self) {
        let ticker = Arc::new(SnapshotTicker::new(
            Arc::clone(&self.raft),
            self.config.snapshot.threshold,
            self.config.snapshot_interval(),
        ));
        let task = Arc::clone(&ticker);
        tokio::spawn(async move { task.run().await });
        self.background.lock().ticker = Some(ticker);
    }

    /// Initialize a new cluster with this node as the only voter.
    pub async fn initialize(&self) -> ClusterResult<()> {
        let members = BTreeMap::from([(
            self.node_id,
            BasicNode {
                addr: self.config.advertise_addr().to_string(),
            },
        )]);

        match self.raft.initialize(members).await {
            Ok(()) => {
                tracing::info!(node_id = self.node_id, "cluster bootstrapped");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                tracing::info!(
                    node_id = self.node_id,
                    "node already initialized, skipping bootstrap"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Join an existing cluster through the configured peers.
    ///
    /// Returns the address of the peer that accepted the request.
    pub async fn join_cluster(&self, metadata: NodeMetadata) -> ClusterResult<String> {
        let coordinator = JoinCoordinator::new(&self.config.join);
        Ok(coordinator
            .join(self.node_id, self.config.advertise_addr(), metadata)
            .await?)
    }

    /// Block until a leader is known.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClusterResult<NodeId> {
        let metrics = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|_| ClusterError::timeout("leader"))?;

        metrics
            .current_leader
            .ok_or_else(|| ClusterError::timeout("leader"))
    }

    /// Block until every entry in the local log at call time is applied.
    ///
    /// A zero timeout skips the wait.
    pub async fn wait_for_applied(&self, timeout: Duration) -> ClusterResult<()> {
        if timeout.is_zero() {
            return Ok(());
        }

        let target = self.metrics().last_log_index;
        tracing::info!(node_id = self.node_id, target = ?target, "waiting for log to be applied");
        self.raft
            .wait(Some(timeout))
            .applied_index_at_least(target, "local log applied")
            .await
            .map_err(|_| ClusterError::timeout("log to be applied"))?;
        Ok(())
    }

    /// Submit a command and wait up to the apply timeout for its result.
    pub async fn apply(&self, command: &Command) -> ClusterResult<ApplyOutcome> {
        command.validate()?;
        let request = command.encode()?;

        let result =
            tokio::time::timeout(self.config.apply_timeout(), self.raft.client_write(request))
                .await;

        match result {
            Err(_) => {
                tracing::warn!(command = command.kind.name(), "timed out waiting for apply");
                Ok(ApplyOutcome::TimedOut)
            }
            Ok(Ok(response)) => Ok(ApplyOutcome::Committed(response.data)),
            Ok(Err(e)) => match forward_to_leader(&e) {
                Some(LeaderInfo {
                    leader_id,
                    leader_addr,
                }) => Ok(ApplyOutcome::NotLeader {
                    leader: leader_id,
                    leader_addr,
                }),
                None => Err(e.into()),
            },
        }
    }

    /// Submit a command, surfacing redirects, timeouts and request-level
    /// errors as [`ClusterError`]s.
    pub async fn execute(&self, command: &Command) -> ClusterResult<StoreResponse> {
        let response = self.apply(command).await?.into_response()?;
        match response.error {
            Some(error) => Err(ClusterError::Command(error)),
            None => Ok(response),
        }
    }

    async fn submit<P: Serialize>(
        &self,
        kind: CommandKind,
        namespace: &str,
        payload: &P,
    ) -> ClusterResult<StoreResponse> {
        let command =
            Command::with_payload(kind, namespace, payload, self.config.store.compression_size)?;
        self.execute(&command).await
    }

    /// Create an empty namespace.
    pub async fn create_namespace(&self, namespace: &str) -> ClusterResult<()> {
        self.execute(&Command::bare(CommandKind::CreateNamespace, namespace))
            .await
            .map(drop)
    }

    /// Replace a namespace's model with one parsed from `text`.
    pub async fn set_model(&self, namespace: &str, text: &str) -> ClusterResult<()> {
        let payload = SetModelPayload {
            text: text.to_string(),
        };
        self.submit(CommandKind::SetModel, namespace, &payload)
            .await
            .map(drop)
    }

    /// Add rules to `sec`/`ptype`. Rules already present are skipped.
    pub async fn add_policies(
        &self,
        namespace: &str,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> ClusterResult<()> {
        let payload = PoliciesPayload {
            sec: sec.to_string(),
            ptype: ptype.to_string(),
            rules,
        };
        self.submit(CommandKind::AddPolicies, namespace, &payload)
            .await
            .map(drop)
    }

    /// Replace one rule.
    pub async fn update_policy(
        &self,
        namespace: &str,
        sec: &str,
        ptype: &str,
        old_rule: Vec<String>,
        new_rule: Vec<String>,
    ) -> ClusterResult<()> {
        let payload = UpdatePolicyPayload {
            sec: sec.to_string(),
            ptype: ptype.to_string(),
            old_rule,
            new_rule,
        };
        self.submit(CommandKind::UpdatePolicy, namespace, &payload)
            .await
            .map(drop)
    }

    /// Replace several rules at once.
    pub async fn update_policies(
        &self,
        namespace: &str,
        sec: &str,
        ptype: &str,
        old_rules: Vec<Vec<String>>,
        new_rules: Vec<Vec<String>>,
    ) -> ClusterResult<()> {
        let payload = UpdatePoliciesPayload {
            sec: sec.to_string(),
            ptype: ptype.to_string(),
            old_rules,
            new_rules,
        };
        self.submit(CommandKind::UpdatePolicies, namespace, &payload)
            .await
            .map(drop)
    }

    /// Remove rules.
    pub async fn remove_policies(
        &self,
        namespace: &str,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> ClusterResult<()> {
        let payload = PoliciesPayload {
            sec: sec.to_string(),
            ptype: ptype.to_string(),
            rules,
        };
        self.submit(CommandKind::RemovePolicies, namespace, &payload)
            .await
            .map(drop)
    }

    /// Remove rules whose fields starting at `field_index` match
    /// `field_values`. Empty values match anything.
    pub async fn remove_filtered_policy(
        &self,
        namespace: &str,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> ClusterResult<()> {
        let payload = RemoveFilteredPolicyPayload {
            sec: sec.to_string(),
            ptype: ptype.to_string(),
            field_index,
            field_values,
        };
        self.submit(CommandKind::RemoveFilteredPolicy, namespace, &payload)
            .await
            .map(drop)
    }

    /// Empty every rule section of a namespace.
    pub async fn clear_policy(&self, namespace: &str) -> ClusterResult<()> {
        self.execute(&Command::bare(CommandKind::ClearPolicy, namespace))
            .await
            .map(drop)
    }

    /// Evaluate a request against a namespace's model.
    ///
    /// Evaluation goes through the log whatever `level` is requested.
    pub async fn enforce<I, P>(
        &self,
        namespace: &str,
        level: ReadConsistency,
        freshness: Duration,
        params: I,
    ) -> ClusterResult<bool>
    where
        I: IntoIterator<Item = P>,
        P: Serialize,
    {
        let params = params
            .into_iter()
            .map(|p| serde_json::to_vec(&p))
            .collect::<Result<Vec<_>, _>>()?;
        let freshness_ms = u64::try_from(freshness.as_millis()).map_err(|_| {
            ClusterError::InvalidRequest(format!("freshness {freshness:?} is out of range"))
        })?;
        let payload = EnforcePayload {
            params,
            level,
            freshness_ms,
        };
        let response = self
            .submit(CommandKind::Enforce, namespace, &payload)
            .await?;
        Ok(response.allowed)
    }

    /// Merge metadata for this node.
    ///
    /// Nothing is submitted when the values are already present. On a
    /// follower this fails with [`ClusterError::NotLeader`].
    pub async fn set_metadata(&self, data: NodeMetadata) -> ClusterResult<()> {
        self.set_metadata_for(self.node_id, data).await
    }

    /// Merge metadata for `node_id`.
    pub async fn set_metadata_for(&self, node_id: NodeId, data: NodeMetadata) -> ClusterResult<()> {
        if self.metadata_store().contains_all(node_id, &data) {
            tracing::debug!(node_id, "metadata unchanged, skipping");
            return Ok(());
        }
        let command = Command::metadata_set(node_id, data, self.config.store.compression_size)?;
        self.execute(&command).await.map(drop)
    }

    /// Drop all metadata of `node_id`.
    pub async fn delete_metadata(&self, node_id: NodeId) -> ClusterResult<()> {
        self.execute(&Command::metadata_delete(node_id)?)
            .await
            .map(drop)
    }

    fn metadata_store(&self) -> &crate::state::MetadataStore {
        self.state_machine.metadata()
    }

    /// Copy of all node metadata on this replica.
    pub fn metadata(&self) -> ClusterMetadata {
        self.metadata_store().read_all()
    }

    /// One metadata value of `node_id`.
    pub fn metadata_for(&self, node_id: NodeId, key: &str) -> Option<String> {
        self.metadata_store().get(node_id, key)
    }

    /// API address the current leader published, if any.
    pub fn leader_api_addr(&self) -> Option<String> {
        let leader = self.metrics().current_leader?;
        self.metadata_for(leader, API_ADDR_KEY)
    }

    /// Admit a node. Only the leader accepts joins.
    ///
    /// The node is added as a learner, promoted when `voter` is set, and its
    /// metadata is replicated once membership is settled.
    pub async fn join(
        &self,
        node_id: NodeId,
        address: &str,
        voter: bool,
        metadata: NodeMetadata,
    ) -> ClusterResult<()> {
        self.ensure_leader()?;

        let metrics = self.metrics();
        let known = metrics
            .membership_config
            .nodes()
            .any(|(id, node)| *id == node_id && node.addr == address);
        let is_voter = metrics
            .membership_config
            .voter_ids()
            .any(|id| id == node_id);

        if known && (is_voter || !voter) {
            tracing::info!(node_id, %address, "node is already a member, ignoring join");
        } else {
            tracing::info!(node_id, %address, voter, "received join request");
            if !known {
                self.raft
                    .add_learner(
                        node_id,
                        BasicNode {
                            addr: address.to_string(),
                        },
                        true,
                    )
                    .await
                    .map_err(write_error)?;
            }
            if voter {
                self.raft
                    .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([node_id])), false)
                    .await
                    .map_err(write_error)?;
            }
            tracing::info!(node_id, %address, voter, "node joined");
        }

        if !metadata.is_empty() {
            self.set_metadata_for(node_id, metadata).await?;
        }
        Ok(())
    }

    /// Remove a node from the cluster and drop its metadata.
    pub async fn remove(&self, node_id: NodeId) -> ClusterResult<()> {
        self.ensure_leader()?;

        let metrics = self.metrics();
        if !metrics
            .membership_config
            .nodes()
            .any(|(id, _)| *id == node_id)
        {
            return Err(ClusterError::NodeNotFound(node_id));
        }

        let voters: BTreeSet<NodeId> = metrics.membership_config.voter_ids().collect();
        let change = if voters.contains(&node_id) {
            if voters.len() == 1 {
                return Err(ClusterError::Config(
                    "cannot remove the last voter from the cluster".to_string(),
                ));
            }
            ChangeMembers::RemoveVoters(BTreeSet::from([node_id]))
        } else {
            ChangeMembers::RemoveNodes(BTreeSet::from([node_id]))
        };

        self.raft
            .change_membership(change, false)
            .await
            .map_err(write_error)?;
        tracing::info!(node_id, "node removed");

        self.delete_metadata(node_id).await
    }

    fn ensure_leader(&self) -> ClusterResult<()> {
        let metrics = self.metrics();
        if metrics.current_leader == Some(self.node_id) {
            return Ok(());
        }
        let leader = metrics.current_leader;
        let leader_addr = leader
            .and_then(|id| {
                metrics
                    .membership_config
                    .nodes()
                    .find(|(node_id, _)| **node_id == id)
                    .map(|(_, node)| node.addr.clone())
            })
            .unwrap_or_default();
        Err(ClusterError::NotLeader {
            leader,
            leader_addr,
        })
    }

    /// Point-in-time view of this node.
    pub async fn stats(&self) -> StoreStats {
        let metrics = self.metrics();
        let voters: BTreeSet<NodeId> = metrics.membership_config.voter_ids().collect();
        let members = metrics
            .membership_config
            .nodes()
            .map(|(id, node)| MemberInfo {
                node_id: *id,
                address: node.addr.clone(),
                voter: voters.contains(id),
            })
            .collect();
        let api_addrs = self
            .metadata()
            .into_iter()
            .filter_map(|(id, data)| data.get(API_ADDR_KEY).map(|addr| (id, addr.clone())))
            .collect();

        StoreStats {
            node_id: self.node_id,
            state: server_state_name(metrics.state),
            leader_id: metrics.current_leader,
            term: metrics.current_term,
            last_log_index: metrics.last_log_index.unwrap_or(0),
            last_applied: metrics.last_applied.map_or(0, |id| id.index),
            snapshot_index: metrics.snapshot.map_or(0, |id| id.index),
            namespaces: self.state_machine.namespace_count().await,
            members,
            api_addrs,
        }
    }

    /// Current leader's node ID.
    pub async fn leader(&self) -> Option<NodeId> {
        self.raft.current_leader().await
    }

    /// Check if this node is the leader.
    pub async fn is_leader(&self) -> bool {
        self.raft.current_leader().await == Some(self.node_id)
    }

    /// Get this node's ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Configuration the store was opened with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Local state machine, for reads that may trail the leader.
    pub fn state_machine(&self) -> &StateMachineStore {
        &self.state_machine
    }

    /// Get Raft metrics.
    pub fn metrics(&self) -> WardenMetrics {
        self.raft.metrics().borrow().clone()
    }

    /// Take a snapshot now.
    pub async fn trigger_snapshot(&self) -> ClusterResult<()> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| ClusterError::Raft(format!("snapshot trigger failed: {e}")))
    }

    /// Serve the cluster service on a client-facing address until `signal`
    /// resolves.
    pub async fn serve_api<F>(&self, addr: SocketAddr, signal: F) -> ClusterResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        tracing::info!(node_id = self.node_id, %addr, "serving client API");
        Server::builder()
            .add_service(ClusterServiceServer::new(ClusterServiceImpl::new(
                self.clone(),
            )))
            .serve_with_shutdown(addr, signal)
            .await?;
        Ok(())
    }

    /// Shut the node down: stop the ticker and the server, then Raft.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        let (server_shutdown, ticker) = {
            let mut background = self.background.lock();
            (background.server_shutdown.take(), background.ticker.take())
        };
        if let Some(ticker) = ticker {
            ticker.stop();
        }
        if let Some(tx) = server_shutdown {
            let _ = tx.send(());
        }

        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Raft(format!("shutdown failed: {e}")))?;

        tracing::info!(node_id = self.node_id, "store closed");
        Ok(())
    }
}

fn write_error(e: WardenRaftWriteError) -> ClusterError {
    match forward_to_leader(&e) {
        Some(LeaderInfo {
            leader_id,
            leader_addr,
        }) => ClusterError::NotLeader {
            leader: leader_id,
            leader_addr,
        },
        None => e.into(),
    }
}

fn server_state_name(state: ServerState) -> &'static str {
    match state {
        ServerState::Leader => "leader",
        ServerState::Follower => "follower",
        ServerState::Candidate => "candidate",
        ServerState::Learner => "learner",
        ServerState::Shutdown => "shutdown",
    }
}
