//! Clustered policy enforcement for Warden.
//!
//! Every node keeps a table of per-namespace policy enforcers plus a small
//! map of per-node metadata. Both are mutated only by applying commands
//! from a Raft log replicated with OpenRaft, so all replicas converge on the
//! same state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Warden node                          │
//! │                                                              │
//! │   Store (façade) ──► Command ──► Raft log ──► apply_command  │
//! │        │                          (LogStore)       │         │
//! │        │                                           ▼         │
//! │        │                     ┌─────────────────────────────┐ │
//! │        │                     │ StateMachineStore           │ │
//! │        │                     │  NamespaceTable  Metadata   │ │
//! │        │                     └──────────────┬──────────────┘ │
//! │        │                                    ▼                │
//! │        │                         SnapshotDocument / files    │
//! │        ▼                                                     │
//! │   gRPC: RaftService (peers)  ClusterService (join, execute)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use warden_cluster::{ClusterConfig, Store};
//!
//! let config = ClusterConfig::builder()
//!     .node_id(1)
//!     .listen_addr("127.0.0.1:4002")
//!     .data_dir("/var/lib/warden")
//!     .build()?;
//!
//! let bootstrap = Store::is_new_node(&config.data_dir);
//! let store = Store::open(config, bootstrap).await?;
//! store.wait_for_leader(Duration::from_secs(10)).await?;
//!
//! store.create_namespace("acme").await?;
//! store.set_model("acme", MODEL_TEXT).await?;
//! let allowed = store
//!     .enforce("acme", ReadConsistency::Strong, Duration::ZERO, ["alice", "data1", "read"])
//!     .await?;
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod join;
pub mod network;
pub mod raft;
pub mod service;
pub mod state;
pub mod types;

// Re-export main types
pub use command::{Command, CommandError, CommandKind, ProtocolError, ReadConsistency};
pub use config::{ClusterConfig, JoinConfig};
pub use error::{ClusterError, ClusterResult};
pub use join::{JoinCoordinator, JoinError};
pub use raft::{ApplyOutcome, Store, StoreStats};
pub use service::ClusterServiceImpl;
pub use state::{ClusterMetadata, NodeMetadata, StateMachineStore, StoreResponse};
pub use types::{NodeId, TypeConfig};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("warden.raft");
}
