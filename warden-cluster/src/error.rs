//! Error types for cluster operations.

use crate::command::{CommandError, ProtocolError};
use crate::join::JoinError;
use crate::state::SnapshotError;
use crate::types::NodeId;
use openraft::BasicNode;
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Type alias for OpenRaft Raft errors.
pub type RaftError<E = openraft::error::Infallible> = openraft::error::RaftError<NodeId, E>;

/// Type alias for OpenRaft RPC errors.
pub type RPCError<E = openraft::error::Infallible> =
    openraft::error::RPCError<NodeId, BasicNode, RaftError<E>>;

/// Type alias for initialize errors.
pub type InitializeError = openraft::error::InitializeError<NodeId, BasicNode>;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// This node is not the leader. Redirect to the leader if it is known.
    #[error("not the leader, leader is node {leader:?} at {leader_addr:?}")]
    NotLeader {
        /// The current leader if known.
        leader: Option<NodeId>,
        /// The leader's raft address (empty if unknown).
        leader_addr: String,
    },

    /// The wait ended before the outcome was known.
    ///
    /// For applies the command may still commit later.
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
    },

    /// The request was refused before reaching the log.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The command was applied and rejected.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A command could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Raft consensus error.
    #[error("Raft error: {0}")]
    Raft(String),

    /// Network/RPC error.
    #[error("Network error: {0}")]
    Network(#[from] tonic::Status),

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Snapshot persistence or restore failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Node not found in cluster.
    #[error("Node {0} not found in cluster")]
    NodeNotFound(NodeId),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Joining an existing cluster failed.
    #[error(transparent)]
    Join(#[from] JoinError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        ClusterError::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether the request should be redirected to the leader.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, ClusterError::NotLeader { .. })
    }

    /// Whether the outcome of the request is unknown.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout { .. })
    }
}

impl<E: std::error::Error> From<RaftError<E>> for ClusterError {
    fn from(e: RaftError<E>) -> Self {
        ClusterError::Raft(e.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}
