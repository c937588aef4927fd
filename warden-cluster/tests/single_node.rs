//! Single-node cluster tests.
//!
//! Tests basic operations on a single-node cluster.

mod common;

use common::{RBAC_MODEL, TestCluster, rule, test_config};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;
use warden_cluster::raft::API_ADDR_KEY;
use warden_cluster::{ClusterError, CommandError, ReadConsistency, Store};

async fn enforce(store: &Store, namespace: &str, request: [&str; 3]) -> bool {
    store
        .enforce(namespace, ReadConsistency::Strong, Duration::ZERO, request)
        .await
        .expect("enforce should succeed")
}

async fn acme(store: &Store) {
    store.create_namespace("acme").await.expect("create");
    store.set_model("acme", RBAC_MODEL).await.expect("set model");
}

/// Test that a single node can start and become leader.
#[tokio::test]
async fn test_single_node_becomes_leader() {
    let mut cluster = TestCluster::new(1).await;

    let leader = cluster
        .leader()
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Should elect a leader");

    assert_eq!(leader, 1, "Single node should be leader");
    assert!(cluster.leader().is_leader().await);

    cluster.shutdown().await;
}

/// Test the basic allow/deny scenario through the log.
#[tokio::test]
async fn test_single_node_role_scenario() {
    let mut cluster = TestCluster::new(1).await;
    let store = cluster.leader();
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    acme(store).await;
    store
        .add_policies("acme", "p", "p", vec![rule(&["admin", "data1", "read"])])
        .await
        .expect("add policy");
    store
        .add_policies("acme", "g", "g", vec![rule(&["alice", "admin"])])
        .await
        .expect("add grouping");

    assert!(enforce(store, "acme", ["alice", "data1", "read"]).await);
    assert!(!enforce(store, "acme", ["bob", "data1", "read"]).await);
    assert!(!enforce(store, "acme", ["alice", "data1", "write"]).await);

    let err = store
        .enforce(
            "acme",
            ReadConsistency::Strong,
            Duration::MAX,
            ["alice", "data1", "read"],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidRequest(_)));

    cluster.shutdown().await;
}

/// Test request-level errors are returned without touching state.
#[tokio::test]
async fn test_single_node_request_errors() {
    let mut cluster = TestCluster::new(1).await;
    let store = cluster.leader();
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    acme(store).await;
    store
        .add_policies("acme", "p", "p", vec![rule(&["alice", "data1", "read"])])
        .await
        .expect("add policy");
    let before = store
        .state_machine()
        .encoded_enforcers()
        .await
        .expect("encode");

    let err = store.create_namespace("acme").await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Command(CommandError::NamespaceExists)
    ));

    let err = store
        .add_policies("missing", "p", "p", vec![rule(&["a", "b", "c"])])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Command(CommandError::NamespaceNotExist)
    ));

    let err = store
        .update_policy(
            "acme",
            "p",
            "p",
            rule(&["nobody", "data1", "read"]),
            rule(&["bob", "data1", "read"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Command(CommandError::Engine(_))));

    let err = store.set_model("acme", "not a model").await.unwrap_err();
    assert!(matches!(err, ClusterError::Command(CommandError::Engine(_))));

    let after = store
        .state_machine()
        .encoded_enforcers()
        .await
        .expect("encode");
    assert_eq!(before, after, "failed commands must not change the table");

    // The node keeps applying after rejected commands.
    assert!(enforce(store, "acme", ["alice", "data1", "read"]).await);

    cluster.shutdown().await;
}

/// Test the rule mutation commands end to end.
#[tokio::test]
async fn test_single_node_policy_mutations() {
    let mut cluster = TestCluster::new(1).await;
    let store = cluster.leader();
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    acme(store).await;
    store
        .add_policies(
            "acme",
            "p",
            "p",
            vec![
                rule(&["alice", "data1", "read"]),
                rule(&["alice", "data2", "write"]),
                rule(&["bob", "data1", "read"]),
            ],
        )
        .await
        .expect("add");

    store
        .update_policy(
            "acme",
            "p",
            "p",
            rule(&["bob", "data1", "read"]),
            rule(&["bob", "data1", "write"]),
        )
        .await
        .expect("update");
    assert!(!enforce(store, "acme", ["bob", "data1", "read"]).await);
    assert!(enforce(store, "acme", ["bob", "data1", "write"]).await);

    store
        .update_policies(
            "acme",
            "p",
            "p",
            vec![rule(&["bob", "data1", "write"])],
            vec![rule(&["carol", "data3", "read"])],
        )
        .await
        .expect("update many");

    store
        .remove_filtered_policy("acme", "p", "p", 0, vec!["alice".to_string()])
        .await
        .expect("remove filtered");
    {
        let state = store.state_machine().state().await;
        let model = state.enforcers.get("acme").expect("namespace").model();
        assert_eq!(model.policy("p", "p"), &[rule(&["carol", "data3", "read"])]);
    }

    store
        .remove_policies("acme", "p", "p", vec![rule(&["carol", "data3", "read"])])
        .await
        .expect("remove");
    assert!(!enforce(store, "acme", ["carol", "data3", "read"]).await);

    store
        .add_policies("acme", "p", "p", vec![rule(&["dave", "data4", "read"])])
        .await
        .expect("add");
    store.clear_policy("acme").await.expect("clear");
    {
        let state = store.state_machine().state().await;
        let model = state.enforcers.get("acme").expect("namespace").model();
        assert!(model.policy("p", "p").is_empty());
        assert!(model.get("m", "m").is_some(), "clear keeps the model");
    }

    cluster.shutdown().await;
}

/// Test metadata merge, skip and lookup.
#[tokio::test]
async fn test_single_node_metadata() {
    let mut cluster = TestCluster::new(1).await;
    let store = cluster.leader();
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let data = BTreeMap::from([(API_ADDR_KEY.to_string(), "127.0.0.1:4001".to_string())]);
    store.set_metadata(data.clone()).await.expect("set");
    let applied = store.metrics().last_applied;

    // Identical values are not submitted again.
    store.set_metadata(data).await.expect("set again");
    assert_eq!(store.metrics().last_applied, applied);

    assert_eq!(
        store.metadata_for(1, API_ADDR_KEY).as_deref(),
        Some("127.0.0.1:4001")
    );
    assert_eq!(store.leader_api_addr().as_deref(), Some("127.0.0.1:4001"));

    let stats = store.stats().await;
    assert_eq!(stats.state, "leader");
    assert_eq!(stats.api_addrs.get(&1).map(String::as_str), Some("127.0.0.1:4001"));

    store.delete_metadata(1).await.expect("delete");
    assert!(store.metadata().is_empty());

    cluster.shutdown().await;
}

/// Test that state survives a restart, replayed from the log.
#[tokio::test]
async fn test_single_node_restart_replays_log() {
    let dir = TempDir::new().expect("tempdir");
    assert!(Store::is_new_node(dir.path()));

    let store = Store::open(test_config(1, dir.path()), true)
        .await
        .expect("open");
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");
    acme(&store).await;
    store
        .add_policies("acme", "p", "p", vec![rule(&["alice", "data1", "read"])])
        .await
        .expect("add");
    store.shutdown().await.expect("shutdown");

    assert!(!Store::is_new_node(dir.path()));
    let store = Store::open(test_config(1, dir.path()), false)
        .await
        .expect("reopen");
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader after restart");
    store
        .wait_for_applied(Duration::from_secs(5))
        .await
        .expect("applied");

    assert_eq!(store.state_machine().namespace_count().await, 1);
    assert!(enforce(&store, "acme", ["alice", "data1", "read"]).await);

    store.shutdown().await.expect("shutdown");
}

/// Test that a snapshot is written and restored on restart.
#[tokio::test]
async fn test_single_node_snapshot_restore() {
    let dir = TempDir::new().expect("tempdir");

    let store = Store::open(test_config(1, dir.path()), true)
        .await
        .expect("open");
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");
    acme(&store).await;
    store
        .add_policies("acme", "p", "p", vec![rule(&["admin", "data1", "read"])])
        .await
        .expect("add");
    store
        .add_policies("acme", "g", "g", vec![rule(&["alice", "admin"])])
        .await
        .expect("add grouping");

    store.trigger_snapshot().await.expect("trigger");
    let applied = store.metrics().last_applied;
    let start = std::time::Instant::now();
    while store.metrics().snapshot != applied {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "snapshot was not built"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    store.shutdown().await.expect("shutdown");

    let store = Store::open(test_config(1, dir.path()), false)
        .await
        .expect("reopen");
    {
        // Restored before any log replay happens.
        let state = store.state_machine().state().await;
        let model = state.enforcers.get("acme").expect("namespace").model();
        assert!(model.has_link("g", "alice", "admin", None));
    }
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader after restart");
    assert!(enforce(&store, "acme", ["alice", "data1", "read"]).await);

    store.shutdown().await.expect("shutdown");
}

/// Test that the ticker snapshots once the threshold is reached.
#[tokio::test]
async fn test_single_node_snapshot_threshold() {
    let mut cluster = TestCluster::with_configs(1, |_, mut config| {
        config.snapshot.threshold = 3;
        config.snapshot.interval_ms = 100;
        config
    })
    .await;
    let store = cluster.leader();
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    for namespace in ["a", "b", "c", "d"] {
        store.create_namespace(namespace).await.expect("create");
    }

    let start = std::time::Instant::now();
    while store.metrics().snapshot.is_none() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "ticker did not snapshot"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.shutdown().await;
}

/// Test that a zero timeout skips the applied wait.
#[tokio::test]
async fn test_single_node_zero_applied_wait() {
    let mut cluster = TestCluster::new(1).await;
    cluster
        .leader()
        .wait_for_applied(Duration::ZERO)
        .await
        .expect("zero wait returns immediately");
    cluster.shutdown().await;
}

/// Test typed policy requests over the cluster service.
#[tokio::test]
async fn test_single_node_execute_typed_requests() {
    use warden_cluster::network::connect;
    use warden_cluster::proto::cluster_service_client::ClusterServiceClient;
    use warden_cluster::proto::execute_request::Op;
    use warden_cluster::proto::{
        CreateNamespaceOp, EnforceOp, ExecuteRequest, PoliciesOp, RemoveFilteredPolicyOp, Rule,
        SetModelOp,
    };

    let mut cluster = TestCluster::new(1).await;
    let store = cluster.leader();
    store
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let channel = connect(&cluster.addresses[0]).await.expect("connect");
    let mut client = ClusterServiceClient::new(channel);
    let request = |op: Op| ExecuteRequest {
        namespace: "acme".to_string(),
        op: Some(op),
    };
    let policies = |sec: &str, rows: &[&[&str]]| PoliciesOp {
        sec: sec.to_string(),
        ptype: sec.to_string(),
        rules: rows
            .iter()
            .map(|fields| Rule {
                fields: rule(fields),
            })
            .collect(),
    };
    let enforce_op = |sub: &str| {
        Op::Enforce(EnforceOp {
            params: rule(&[sub, "data1", "read"]),
            level: 0,
            freshness_ms: 0,
        })
    };

    for op in [
        Op::CreateNamespace(CreateNamespaceOp {}),
        Op::SetModel(SetModelOp {
            text: RBAC_MODEL.to_string(),
        }),
        Op::AddPolicies(policies("p", &[&["admin", "data1", "read"]])),
        Op::AddPolicies(policies("g", &[&["alice", "admin"]])),
    ] {
        let reply = client.execute(request(op)).await.expect("execute").into_inner();
        assert!(reply.success, "unexpected error: {}", reply.error);
    }

    let reply = client.execute(request(enforce_op("alice"))).await.expect("execute").into_inner();
    assert!(reply.success && reply.allowed);
    let reply = client.execute(request(enforce_op("bob"))).await.expect("execute").into_inner();
    assert!(reply.success && !reply.allowed);

    let reply = client
        .execute(request(Op::CreateNamespace(CreateNamespaceOp {})))
        .await
        .expect("execute")
        .into_inner();
    assert!(!reply.success);
    assert_eq!(reply.error, CommandError::NamespaceExists.to_string());

    let reply = client
        .execute(request(Op::RemoveFilteredPolicy(RemoveFilteredPolicyOp {
            sec: "g".to_string(),
            ptype: "g".to_string(),
            field_index: 0,
            field_values: Vec::new(),
        })))
        .await
        .expect("execute")
        .into_inner();
    assert!(reply.success);
    assert!(!enforce(store, "acme", ["alice", "data1", "read"]).await);

    let status = client
        .execute(ExecuteRequest {
            namespace: "acme".to_string(),
            op: None,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    cluster.shutdown().await;
}
