//! Common test utilities for warden-cluster tests.

use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use warden_cluster::{ClusterConfig, JoinConfig, Store};

/// Atomic counter for allocating unique ports.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(25000);

/// Model used by most tests: one policy section and one role section.
#[allow(dead_code)]
pub const RBAC_MODEL: &str = r#"
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
"#;

/// Get a unique port for testing.
pub fn get_test_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Convert string literals into an owned rule.
#[allow(dead_code)]
pub fn rule(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

/// Test configuration with a fresh address.
pub fn test_config(node_id: u64, data_dir: &Path) -> ClusterConfig {
    ClusterConfig::builder()
        .node_id(node_id)
        .listen_addr(format!("127.0.0.1:{}", get_test_port()))
        .api_addr(format!("127.0.0.1:{}", get_test_port()))
        .data_dir(data_dir)
        .apply_timeout_ms(5_000)
        .snapshot_interval_ms(60_000)
        .build()
        .expect("Invalid config")
}

/// Test context that holds temp directories and nodes.
#[allow(dead_code)]
pub struct TestCluster {
    /// Temp directories for each node (kept alive for the test duration).
    _temp_dirs: Vec<TempDir>,
    /// Cluster nodes; node `i` has ID `i + 1`.
    pub nodes: Vec<Store>,
    /// Raft addresses.
    pub addresses: Vec<String>,
}

#[allow(dead_code)]
impl TestCluster {
    /// Start `node_count` nodes. Node 1 bootstraps a cluster of its own;
    /// the others start empty until they are joined.
    pub async fn new(node_count: usize) -> Self {
        Self::with_configs(node_count, |_, config| config).await
    }

    /// Like [`TestCluster::new`], letting the caller adjust each config.
    pub async fn with_configs(
        node_count: usize,
        adjust: impl Fn(usize, ClusterConfig) -> ClusterConfig,
    ) -> Self {
        let mut temp_dirs = Vec::with_capacity(node_count);
        let mut nodes = Vec::with_capacity(node_count);
        let mut addresses = Vec::with_capacity(node_count);

        for i in 0..node_count {
            let temp_dir = TempDir::new().expect("Failed to create temp dir");
            let config = adjust(i, test_config(i as u64 + 1, temp_dir.path()));
            addresses.push(config.listen_addr.clone());

            let node = Store::open(config, i == 0)
                .await
                .expect("Failed to open store");
            nodes.push(node);
            temp_dirs.push(temp_dir);
        }

        Self {
            _temp_dirs: temp_dirs,
            nodes,
            addresses,
        }
    }

    /// The bootstrap node.
    pub fn leader(&self) -> &Store {
        &self.nodes[0]
    }

    /// Join every other node as a voter through node 1.
    pub async fn join_all(&self) {
        self.nodes[0]
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("Bootstrap node should become leader");

        for i in 1..self.nodes.len() {
            self.nodes[0]
                .join(
                    (i + 1) as u64,
                    &self.addresses[i],
                    true,
                    Default::default(),
                )
                .await
                .expect("Failed to join node");
        }
    }

    /// Join configuration pointing at node 1.
    pub fn join_config(&self) -> JoinConfig {
        JoinConfig {
            interval_ms: 200,
            ..JoinConfig::with_peers(vec![self.addresses[0].clone()])
        }
    }

    /// Wait until every node has applied at least `index`.
    pub async fn wait_applied(&self, index: u64, timeout_ms: u64) {
        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(timeout_ms);

        while start.elapsed() < timeout {
            let done = self.nodes.iter().all(|node| {
                node.metrics()
                    .last_applied
                    .is_some_and(|log_id| log_id.index >= index)
            });
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("nodes did not apply index {index} within {timeout_ms}ms");
    }

    /// Shutdown all nodes.
    pub async fn shutdown(&mut self) {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
    }
}
