//! Replicated state.
//!
//! The state machine receives committed log entries (encoded commands) and
//! applies them to the namespace table and the cluster metadata. All nodes
//! apply the same entries in the same order, so all replicas hold the same
//! state.

pub mod machine;
pub mod metadata;
pub mod namespaces;
pub mod snapshot;

pub use machine::{StateMachineData, StateMachineStore, StoreResponse, StoredSnapshot};
pub use metadata::{ClusterMetadata, MetadataStore, NodeMetadata};
pub use namespaces::{Enforcer, NamespaceTable, TableDecodeError};
pub use snapshot::{SnapshotDocument, SnapshotError, SnapshotSink, SnapshotStore};
