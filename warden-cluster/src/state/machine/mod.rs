//! Raft state machine for Warden's replicated state.
//!
//! The state machine is the core of the cluster's replicated state. It:
//! - Receives committed log entries (encoded commands)
//! - Applies them in log order to the namespace table and cluster metadata
//! - Builds, persists and installs snapshots
//!
//! ## Module Structure
//!
//! - `types`: Response and stored-snapshot types
//! - `apply`: Command application logic
//! - `traits`: OpenRaft trait implementations

mod apply;
mod traits;
mod types;

pub use apply::apply_command;
pub use types::{StoreResponse, StoredSnapshot};

use crate::state::metadata::MetadataStore;
use crate::state::namespaces::NamespaceTable;
use crate::state::snapshot::{SnapshotDocument, SnapshotError, SnapshotStore};
use crate::types::{WardenLogId, WardenStoredMembership};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::RwLock;
use warden_core::{MatcherEvaluator, PolicyEvaluator};

/// State owned by the apply path.
#[derive(Debug, Clone, Default)]
pub struct StateMachineData {
    /// Last applied log ID.
    pub last_applied_log: Option<WardenLogId>,
    /// Last applied membership.
    pub last_membership: WardenStoredMembership,
    /// Namespace → enforcer.
    pub enforcers: NamespaceTable,
}

/// The Raft state machine.
///
/// `state` is only written by `apply` and snapshot install. The metadata
/// store has its own lock so it can be read without waiting for apply.
pub struct StateMachineStore {
    state: RwLock<StateMachineData>,
    metadata: MetadataStore,
    evaluator: Arc<dyn PolicyEvaluator>,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
    snapshots: Option<SnapshotStore>,
}

impl fmt::Debug for StateMachineStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachineStore")
            .field("metadata", &self.metadata)
            .field("snapshots", &self.snapshots)
            .finish_non_exhaustive()
    }
}

impl Default for StateMachineStore {
    fn default() -> Self {
        Self::new(Arc::new(MatcherEvaluator::new()))
    }
}

impl StateMachineStore {
    /// Create an in-memory state machine. Snapshots are kept in memory only.
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        Self {
            state: RwLock::new(StateMachineData::default()),
            metadata: MetadataStore::new(),
            evaluator,
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
            snapshots: None,
        }
    }

    /// Open a state machine whose snapshots live under `data_dir`,
    /// restoring the newest one if present.
    pub fn open(
        data_dir: &Path,
        retained: usize,
        evaluator: Arc<dyn PolicyEvaluator>,
    ) -> Result<Self, SnapshotError> {
        let snapshots = SnapshotStore::open(data_dir, retained)?;
        let latest = snapshots.load_latest()?;

        let mut sm = Self::new(evaluator);
        if let Some(snapshot) = latest {
            let (enforcers, metadata) = SnapshotDocument::decode(&snapshot.data)?.restore()?;
            tracing::info!(
                snapshot_id = %snapshot.meta.snapshot_id,
                namespaces = enforcers.len(),
                "restored state machine from snapshot"
            );

            sm.metadata.replace(metadata);
            sm.state = RwLock::new(StateMachineData {
                last_applied_log: snapshot.meta.last_log_id,
                last_membership: snapshot.meta.last_membership.clone(),
                enforcers,
            });
            sm.current_snapshot = RwLock::new(Some(snapshot));
        }
        sm.snapshots = Some(snapshots);
        Ok(sm)
    }

    /// Read-only view of the current state.
    ///
    /// This is the local replica's state: it may trail the leader.
    pub async fn state(&self) -> tokio::sync::RwLockReadGuard<'_, StateMachineData> {
        self.state.read().await
    }

    /// Lock-guarded cluster metadata.
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Number of namespaces on this replica.
    pub async fn namespace_count(&self) -> usize {
        self.state.read().await.enforcers.len()
    }

    /// Encoded namespace table, for comparing replicas.
    pub async fn encoded_enforcers(&self) -> Result<Vec<u8>, serde_json::Error> {
        self.state.read().await.enforcers.encode()
    }
}
