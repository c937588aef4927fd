//! Trait implementations for OpenRaft integration.

use crate::types::{
    TypeConfig, WardenEntry, WardenLogId, WardenSnapshot, WardenSnapshotMeta, WardenStorageError,
    WardenStoredMembership,
};
use openraft::storage::RaftStateMachine;
use openraft::{
    EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError, StoredMembership,
};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::StateMachineStore;
use super::apply::apply_command;
use super::types::{StoreResponse, StoredSnapshot};
use crate::state::snapshot::SnapshotDocument;

impl StateMachineStore {
    /// Write a snapshot to disk on the blocking pool, if this state machine
    /// has a snapshot store.
    async fn persist_snapshot(
        self: &Arc<Self>,
        snapshot: &StoredSnapshot,
    ) -> Result<(), WardenStorageError> {
        if self.snapshots.is_none() {
            return Ok(());
        }

        let sm = Arc::clone(self);
        let stored = snapshot.clone();
        let signature = snapshot.meta.signature();
        tokio::task::spawn_blocking(move || match &sm.snapshots {
            Some(store) => store.persist(&stored.meta, &stored.data),
            None => Ok(()),
        })
        .await
        .map_err(|e| StorageIOError::write_snapshot(Some(signature.clone()), &e))?
        .map_err(|e| StorageIOError::write_snapshot(Some(signature), &e))?;
        Ok(())
    }
}

/// Implementation of OpenRaft's snapshot builder interface.
///
/// Captures the namespace table and the cluster metadata under the state
/// lock, so the artifact matches `last_applied_log` exactly.
impl RaftSnapshotBuilder<TypeConfig> for Arc<StateMachineStore> {
    async fn build_snapshot(&mut self) -> Result<WardenSnapshot, WardenStorageError> {
        let state = self.state.read().await;

        let data = SnapshotDocument::build(&state.enforcers, &self.metadata)
            .and_then(|doc| doc.encode())
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let last_applied_log = state.last_applied_log;
        let last_membership = state.last_membership.clone();

        // Lock snapshot before releasing state lock
        let mut current_snapshot = self.current_snapshot.write().await;
        drop(state);

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied_log {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let meta = WardenSnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };
        let snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };

        self.persist_snapshot(&snapshot).await?;
        *current_snapshot = Some(snapshot);

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "built snapshot"
        );

        Ok(WardenSnapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// Implementation of OpenRaft's state machine interface.
///
/// Entries are applied one at a time in log order. An entry that cannot be
/// decoded is reported as a storage error, which stops the Raft core: the
/// replica would otherwise diverge from the rest of the cluster.
impl RaftStateMachine<TypeConfig> for Arc<StateMachineStore> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<WardenLogId>, WardenStoredMembership), WardenStorageError> {
        let state = self.state.read().await;
        Ok((state.last_applied_log, state.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<StoreResponse>, WardenStorageError>
    where
        I: IntoIterator<Item = WardenEntry> + Send,
    {
        let mut responses = Vec::new();
        let mut state = self.state.write().await;

        for entry in entries {
            tracing::debug!(%entry.log_id, "applying to state machine");

            state.last_applied_log = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => {
                    responses.push(StoreResponse::ok());
                }
                EntryPayload::Normal(ref request) => {
                    let response =
                        apply_command(&mut state, &self.metadata, self.evaluator.as_ref(), request)
                            .map_err(|e| {
                                tracing::error!(
                                    log_id = %entry.log_id,
                                    error = %e,
                                    "undecodable log entry, halting state machine"
                                );
                                StorageIOError::apply(entry.log_id, &e)
                            })?;
                    responses.push(response);
                }
                EntryPayload::Membership(membership) => {
                    state.last_membership = StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(StoreResponse::ok());
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, WardenStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &WardenSnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), WardenStorageError> {
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            snapshot_size = snapshot.get_ref().len(),
            "installing snapshot"
        );

        let new_snapshot = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };

        // Decode everything before touching live state: restore is all-or-nothing.
        let (enforcers, metadata) = SnapshotDocument::decode(&new_snapshot.data)
            .and_then(|doc| doc.restore())
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        self.persist_snapshot(&new_snapshot).await?;

        let mut state = self.state.write().await;
        state.enforcers = enforcers;
        state.last_applied_log = meta.last_log_id;
        state.last_membership = meta.last_membership.clone();
        self.metadata.replace(metadata);

        // Lock snapshot before releasing state lock
        let mut current_snapshot = self.current_snapshot.write().await;
        drop(state);

        *current_snapshot = Some(new_snapshot);
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<WardenSnapshot>, WardenStorageError> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(WardenSnapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandKind, PoliciesPayload, SetModelPayload};
    use openraft::{CommittedLeaderId, Entry, LogId};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use warden_core::MatcherEvaluator;

    const MODEL: &str = "
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
";

    fn entry(index: u64, cmd: Command) -> WardenEntry {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(cmd.encode().expect("encode")),
        }
    }

    fn seed_entries() -> Vec<WardenEntry> {
        let model = SetModelPayload { text: MODEL.into() };
        let grouping = PoliciesPayload {
            sec: "g".into(),
            ptype: "g".into(),
            rules: vec![vec!["alice".into(), "admin".into()]],
        };
        vec![
            entry(1, Command::bare(CommandKind::CreateNamespace, "acme")),
            entry(
                2,
                Command::with_payload(CommandKind::SetModel, "acme", &model, 150).expect("cmd"),
            ),
            entry(
                3,
                Command::with_payload(CommandKind::AddPolicies, "acme", &grouping, 150)
                    .expect("cmd"),
            ),
            entry(
                4,
                Command::metadata_set(
                    1,
                    BTreeMap::from([("api_addr".to_string(), "a".to_string())]),
                    0,
                )
                .expect("cmd"),
            ),
        ]
    }

    fn store(dir: &TempDir) -> Arc<StateMachineStore> {
        Arc::new(
            StateMachineStore::open(dir.path(), 2, Arc::new(MatcherEvaluator::new()))
                .expect("open"),
        )
    }

    #[tokio::test]
    async fn test_apply_tracks_last_applied() {
        let mut sm = Arc::new(StateMachineStore::default());
        let responses = sm.apply(seed_entries()).await.expect("apply");

        assert_eq!(responses.len(), 4);
        assert!(responses.iter().all(|r| r.error.is_none()));
        let (applied, _) = sm.applied_state().await.expect("applied");
        assert_eq!(applied.map(|id| id.index), Some(4));
    }

    #[tokio::test]
    async fn test_undecodable_entry_halts() {
        let mut sm = Arc::new(StateMachineStore::default());
        let bad = Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), 1),
            payload: EntryPayload::Normal(crate::types::RaftRequest(b"garbage".to_vec())),
        };
        assert!(sm.apply(vec![bad]).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let mut sm = store(&dir);
        sm.apply(seed_entries()).await.expect("apply");

        let mut builder = sm.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.expect("snapshot");
        assert_eq!(snapshot.meta.last_log_id.map(|id| id.index), Some(4));
        let before = sm.encoded_enforcers().await.expect("encode");
        drop(sm);

        let mut reopened = store(&dir);
        let (applied, _) = reopened.applied_state().await.expect("applied");
        assert_eq!(applied.map(|id| id.index), Some(4));
        assert_eq!(reopened.encoded_enforcers().await.expect("encode"), before);
        assert_eq!(reopened.metadata().get(1, "api_addr").as_deref(), Some("a"));

        let state = reopened.state().await;
        let model = state.enforcers.get("acme").expect("acme").model();
        assert!(model.has_link("g", "alice", "admin", None));
        drop(state);
        assert!(reopened.get_current_snapshot().await.expect("current").is_some());
    }

    #[tokio::test]
    async fn test_install_snapshot_replaces_state() {
        let mut source = Arc::new(StateMachineStore::default());
        source.apply(seed_entries()).await.expect("apply");
        let snapshot = source
            .get_snapshot_builder()
            .await
            .build_snapshot()
            .await
            .expect("snapshot");

        let mut target = Arc::new(StateMachineStore::default());
        target
            .apply(vec![entry(1, Command::bare(CommandKind::CreateNamespace, "stale"))])
            .await
            .expect("apply");

        target
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .expect("install");

        let state = target.state().await;
        assert!(state.enforcers.get("stale").is_none());
        assert!(state.enforcers.contains("acme"));
        assert_eq!(state.last_applied_log.map(|id| id.index), Some(4));
        drop(state);
        assert_eq!(target.metadata().get(1, "api_addr").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_install_rejects_corrupt_snapshot() {
        let mut sm = Arc::new(StateMachineStore::default());
        sm.apply(seed_entries()).await.expect("apply");
        let meta = WardenSnapshotMeta::default();

        let result = sm
            .install_snapshot(&meta, Box::new(Cursor::new(b"nope".to_vec())))
            .await;
        assert!(result.is_err());
        assert!(sm.state().await.enforcers.contains("acme"));
    }
}
