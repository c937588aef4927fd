//! Cluster metadata: per-node key/value data such as API addresses.
//!
//! Writes come only from the apply path. Reads come from anywhere (peer
//! discovery, status, redirects) and take the read half of the lock.

use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata of one node.
pub type NodeMetadata = BTreeMap<String, String>;

/// Metadata of every node, keyed by node ID.
pub type ClusterMetadata = BTreeMap<NodeId, NodeMetadata>;

/// Shared, lock-guarded cluster metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
    inner: Arc<RwLock<ClusterMetadata>>,
}

impl MetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `data` into `node_id`'s entry, writing only keys whose value
    /// differs. Returns whether anything changed.
    pub fn merge(&self, node_id: NodeId, data: &NodeMetadata) -> bool {
        if self.contains_all(node_id, data) {
            return false;
        }

        let mut guard = self.inner.write();
        let entry = guard.entry(node_id).or_default();
        let mut changed = false;
        for (key, value) in data {
            if entry.get(key) != Some(value) {
                entry.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Remove `node_id`'s entry. Returns whether it existed.
    pub fn delete(&self, node_id: NodeId) -> bool {
        self.inner.write().remove(&node_id).is_some()
    }

    /// Copy of the whole mapping.
    pub fn read_all(&self) -> ClusterMetadata {
        self.inner.read().clone()
    }

    /// Value of `key` for `node_id`.
    pub fn get(&self, node_id: NodeId, key: &str) -> Option<String> {
        self.inner
            .read()
            .get(&node_id)
            .and_then(|entry| entry.get(key).cloned())
    }

    /// Whether `node_id` already holds every pair in `data`.
    pub fn contains_all(&self, node_id: NodeId, data: &NodeMetadata) -> bool {
        let guard = self.inner.read();
        match guard.get(&node_id) {
            Some(entry) => data.iter().all(|(k, v)| entry.get(k) == Some(v)),
            None => data.is_empty(),
        }
    }

    /// Replace the whole mapping (snapshot restore).
    pub fn replace(&self, metadata: ClusterMetadata) {
        *self.inner.write() = metadata;
    }

    /// Encode the mapping for a snapshot.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&*self.inner.read())
    }

    /// Decode a mapping produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<ClusterMetadata, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> NodeMetadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_is_idempotent() {
        let store = MetadataStore::new();
        let data = kv(&[("api_addr", "10.0.0.1:4001")]);

        assert!(store.merge(1, &data));
        let after_first = store.read_all();
        assert!(!store.merge(1, &data));
        assert_eq!(store.read_all(), after_first);
    }

    #[test]
    fn test_merge_keeps_other_keys() {
        let store = MetadataStore::new();
        store.merge(1, &kv(&[("api_addr", "a"), ("api_proto", "http")]));
        assert!(store.merge(1, &kv(&[("api_addr", "b")])));

        assert_eq!(store.get(1, "api_addr").as_deref(), Some("b"));
        assert_eq!(store.get(1, "api_proto").as_deref(), Some("http"));
    }

    #[test]
    fn test_delete_removes_whole_entry() {
        let store = MetadataStore::new();
        store.merge(1, &kv(&[("api_addr", "a")]));
        store.merge(2, &kv(&[("api_addr", "b")]));

        assert!(store.delete(1));
        assert!(!store.delete(1));
        assert_eq!(store.read_all().keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_contains_all() {
        let store = MetadataStore::new();
        assert!(store.contains_all(7, &NodeMetadata::new()));
        assert!(!store.contains_all(7, &kv(&[("k", "v")])));

        store.merge(7, &kv(&[("k", "v"), ("x", "y")]));
        assert!(store.contains_all(7, &kv(&[("k", "v")])));
        assert!(!store.contains_all(7, &kv(&[("k", "other")])));
    }

    #[test]
    fn test_clones_share_state() {
        let store = MetadataStore::new();
        let reader = store.clone();
        store.merge(3, &kv(&[("api_addr", "c")]));
        assert_eq!(reader.get(3, "api_addr").as_deref(), Some("c"));
    }
}
