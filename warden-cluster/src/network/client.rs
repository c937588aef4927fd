//! Network client implementing OpenRaft's RaftNetwork trait.
//!
//! Request and response bodies are JSON. The server encodes the full
//! `Result` of the local Raft call, so errors raised by the remote Raft
//! core arrive here as [`RemoteError`]s rather than transport failures.

use crate::error::{ClusterError, RPCError, RaftError};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use crate::types::{NodeId, TypeConfig};
use openraft::BasicNode;
use openraft::error::{InstallSnapshotError, NetworkError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest as RaftAppendRequest, AppendEntriesResponse as RaftAppendResponse,
    InstallSnapshotRequest as RaftSnapshotRequest, InstallSnapshotResponse as RaftSnapshotResponse,
    VoteRequest as RaftVoteRequest, VoteResponse as RaftVoteResponse,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tonic::transport::{Channel, Endpoint};

/// Connect a gRPC channel to `addr` (`host:port`).
pub async fn connect(addr: &str) -> Result<Channel, ClusterError> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))
        .map_err(|e| ClusterError::Config(format!("invalid address {addr}: {e}")))?;
    Ok(endpoint.connect().await?)
}

/// Factory for creating network connections to other nodes.
///
/// Channels are cached per node and dropped when a call through them
/// fails, so a restarted peer is reconnected on the next attempt.
#[derive(Clone, Default)]
pub struct NetworkClient {
    connections: Arc<RwLock<HashMap<NodeId, Channel>>>,
}

impl NetworkClient {
    /// Create a new network client.
    pub fn new() -> Self {
        Self::default()
    }

    async fn channel(&self, target: NodeId, addr: &str) -> Result<Channel, ClusterError> {
        if let Some(channel) = self.connections.read().get(&target) {
            return Ok(channel.clone());
        }

        let channel = connect(addr).await?;
        self.connections.write().insert(target, channel.clone());
        Ok(channel)
    }

    fn forget(&self, target: NodeId) {
        self.connections.write().remove(&target);
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkClient {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            client: self.clone(),
        }
    }
}

/// A connection to a specific node.
pub struct NetworkConnection {
    target: NodeId,
    addr: String,
    client: NetworkClient,
}

impl NetworkConnection {
    /// Send one JSON-bodied RPC and decode the remote `Result`.
    async fn call<Req, Resp, E, F, Fut>(&self, req: &Req, rpc: F) -> Result<Resp, RPCError<E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
        F: FnOnce(RaftServiceClient<Channel>, Vec<u8>) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, tonic::Status>>,
    {
        let data = serde_json::to_vec(req).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let channel = self
            .client
            .channel(self.target, &self.addr)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;

        let body = match rpc(RaftServiceClient::new(channel), data).await {
            Ok(body) => body,
            Err(status) => {
                self.client.forget(self.target);
                return Err(RPCError::Unreachable(Unreachable::new(&status)));
            }
        };

        let result: Result<Resp, RaftError<E>> =
            serde_json::from_slice(&body).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        req: RaftAppendRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<RaftAppendResponse<NodeId>, RPCError> {
        self.call(&req, |mut client, data| async move {
            client
                .append_entries(AppendEntriesRequest { data })
                .await
                .map(|r| r.into_inner().data)
        })
        .await
    }

    async fn install_snapshot(
        &mut self,
        req: RaftSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<RaftSnapshotResponse<NodeId>, RPCError<InstallSnapshotError>> {
        self.call(&req, |mut client, data| async move {
            client
                .install_snapshot(InstallSnapshotRequest { data })
                .await
                .map(|r| r.into_inner().data)
        })
        .await
    }

    async fn vote(
        &mut self,
        req: RaftVoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<RaftVoteResponse<NodeId>, RPCError> {
        self.call(&req, |mut client, data| async move {
            client
                .request_vote(VoteRequest { data })
                .await
                .map(|r| r.into_inner().data)
        })
        .await
    }
}
