//! gRPC server for handling Raft RPC requests.

use crate::proto::raft_service_server::RaftService;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::types::WardenRaft;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// gRPC server implementation for Raft RPC.
pub struct RaftServer {
    raft: Arc<WardenRaft>,
}

impl RaftServer {
    /// Create a new Raft server.
    pub fn new(raft: Arc<WardenRaft>) -> Self {
        Self { raft }
    }
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, Status> {
    serde_json::from_slice(data).map_err(|e| Status::invalid_argument(e.to_string()))
}

/// Encode the whole result; Raft errors travel in the body.
fn encode<T: Serialize, E: Serialize>(result: &Result<T, E>) -> Result<Vec<u8>, Status> {
    serde_json::to_vec(result).map_err(|e| Status::internal(e.to_string()))
}

#[tonic::async_trait]
impl RaftService for RaftServer {
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = decode(&request.into_inner().data)?;
        let result = self.raft.append_entries(req).await;
        Ok(Response::new(AppendEntriesResponse {
            data: encode(&result)?,
        }))
    }

    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = decode(&request.into_inner().data)?;
        let result = self.raft.vote(req).await;
        Ok(Response::new(VoteResponse {
            data: encode(&result)?,
        }))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        let req = decode(&request.into_inner().data)?;
        let result = self.raft.install_snapshot(req).await;
        Ok(Response::new(InstallSnapshotResponse {
            data: encode(&result)?,
        }))
    }
}
