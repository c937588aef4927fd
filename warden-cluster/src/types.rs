//! Type definitions for OpenRaft integration.
//!
//! Log entries carry [`RaftRequest`]: an opaque, already-encoded command
//! envelope. Decoding happens inside the state machine so that a replica
//! running an incompatible protocol version fails loudly at apply time.

use crate::state::StoreResponse;
use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Node ID type for the cluster.
pub type NodeId = u64;

/// Encoded command as stored in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RaftRequest(pub Vec<u8>);

openraft::declare_raft_types!(
    /// OpenRaft type configuration for Warden.
    pub TypeConfig:
        D = RaftRequest,
        R = StoreResponse,
);

/// Raft instance.
pub type WardenRaft = openraft::Raft<TypeConfig>;

/// Log entry.
pub type WardenEntry = openraft::Entry<TypeConfig>;

/// Vote.
pub type WardenVote = openraft::Vote<NodeId>;

/// Log ID.
pub type WardenLogId = openraft::LogId<NodeId>;

/// Stored membership.
pub type WardenStoredMembership = openraft::StoredMembership<NodeId, BasicNode>;

/// Snapshot metadata.
pub type WardenSnapshotMeta = openraft::SnapshotMeta<NodeId, BasicNode>;

/// Snapshot.
pub type WardenSnapshot = openraft::storage::Snapshot<TypeConfig>;

/// Storage error.
pub type WardenStorageError = openraft::StorageError<NodeId>;

/// Raft metrics.
pub type WardenMetrics = openraft::RaftMetrics<NodeId, BasicNode>;

/// Client write error.
pub type WardenClientWriteError = openraft::error::ClientWriteError<NodeId, BasicNode>;

/// Raft error wrapping a client write error.
pub type WardenRaftWriteError = openraft::error::RaftError<NodeId, WardenClientWriteError>;

/// Where to redirect a request that reached a follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    /// The leader's node ID, if known.
    pub leader_id: Option<NodeId>,
    /// The leader's raft address (empty if unknown).
    pub leader_addr: String,
}

/// Extract redirect information from a client write error.
///
/// Returns `None` for every error other than `ForwardToLeader`.
pub fn forward_to_leader(error: &WardenRaftWriteError) -> Option<LeaderInfo> {
    use openraft::error::RaftError;

    match error {
        RaftError::APIError(WardenClientWriteError::ForwardToLeader(forward)) => Some(LeaderInfo {
            leader_id: forward.leader_id,
            leader_addr: forward
                .leader_node
                .as_ref()
                .map(|n| n.addr.clone())
                .unwrap_or_default(),
        }),
        _ => None,
    }
}
