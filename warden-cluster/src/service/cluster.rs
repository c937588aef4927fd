//! ClusterService gRPC implementation for peers and external clients.

use crate::command::ReadConsistency;
use crate::error::{ClusterError, ClusterResult};
use crate::proto::cluster_service_server::ClusterService;
use crate::proto::execute_request::Op;
use crate::proto::{
    Consistency, ExecuteRequest, ExecuteResponse, JoinRequest, JoinResponse, NodeInfo,
    RemoveNodeRequest, RemoveNodeResponse, Rule, StatusRequest, StatusResponse,
};
use crate::raft::Store;
use std::time::Duration;
use tonic::{Request, Response, Status};

/// gRPC service implementation over a [`Store`].
///
/// This service handles:
/// - Typed policy operations on the leader, with a redirect address
///   otherwise. Commands are built here, never decoded from client bytes.
/// - Cluster status queries
/// - Membership changes (join/remove)
pub struct ClusterServiceImpl {
    store: Store,
}

impl ClusterServiceImpl {
    /// Create a new cluster service.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run one policy operation through the store. Returns the decision for
    /// `Enforce` and `false` otherwise.
    async fn run(&self, ns: &str, op: Op) -> ClusterResult<bool> {
        let store = &self.store;
        match op {
            Op::CreateNamespace(_) => store.create_namespace(ns).await?,
            Op::SetModel(op) => store.set_model(ns, &op.text).await?,
            Op::AddPolicies(op) => {
                store
                    .add_policies(ns, &op.sec, &op.ptype, rows(op.rules))
                    .await?
            }
            Op::UpdatePolicy(op) => {
                let old_rule = op.old_rule.map(|r| r.fields).unwrap_or_default();
                let new_rule = op.new_rule.map(|r| r.fields).unwrap_or_default();
                store
                    .update_policy(ns, &op.sec, &op.ptype, old_rule, new_rule)
                    .await?
            }
            Op::UpdatePolicies(op) => {
                store
                    .update_policies(ns, &op.sec, &op.ptype, rows(op.old_rules), rows(op.new_rules))
                    .await?
            }
            Op::RemovePolicies(op) => {
                store
                    .remove_policies(ns, &op.sec, &op.ptype, rows(op.rules))
                    .await?
            }
            Op::RemoveFilteredPolicy(op) => {
                let field_index = usize::try_from(op.field_index).map_err(|_| {
                    ClusterError::InvalidRequest(format!(
                        "field index {} is out of range",
                        op.field_index
                    ))
                })?;
                store
                    .remove_filtered_policy(ns, &op.sec, &op.ptype, field_index, op.field_values)
                    .await?
            }
            Op::ClearPolicy(_) => store.clear_policy(ns).await?,
            Op::Enforce(op) => {
                let level = read_consistency(op.level());
                let freshness = Duration::from_millis(op.freshness_ms);
                return store.enforce(ns, level, freshness, op.params).await;
            }
        }
        Ok(false)
    }
}

fn rows(rules: Vec<Rule>) -> Vec<Vec<String>> {
    rules.into_iter().map(|rule| rule.fields).collect()
}

fn read_consistency(level: Consistency) -> ReadConsistency {
    match level {
        Consistency::Strong => ReadConsistency::Strong,
        Consistency::Weak => ReadConsistency::Weak,
        Consistency::None => ReadConsistency::None,
    }
}

fn op_name(op: &Op) -> &'static str {
    match op {
        Op::CreateNamespace(_) => "CreateNamespace",
        Op::SetModel(_) => "SetModel",
        Op::AddPolicies(_) => "AddPolicies",
        Op::UpdatePolicy(_) => "UpdatePolicy",
        Op::UpdatePolicies(_) => "UpdatePolicies",
        Op::RemovePolicies(_) => "RemovePolicies",
        Op::RemoveFilteredPolicy(_) => "RemoveFilteredPolicy",
        Op::ClearPolicy(_) => "ClearPolicy",
        Op::Enforce(_) => "Enforce",
    }
}

/// Split an error into (message, leader address for redirects).
fn describe(error: &ClusterError) -> (String, String) {
    match error {
        ClusterError::NotLeader { leader_addr, .. } => {
            ("not the leader".to_string(), leader_addr.clone())
        }
        other => (other.to_string(), String::new()),
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterServiceImpl {
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let req = request.into_inner();
        let op = req
            .op
            .ok_or_else(|| Status::invalid_argument("missing operation"))?;

        tracing::debug!(op = op_name(&op), namespace = %req.namespace, "executing request");

        let response = match self.run(&req.namespace, op).await {
            Ok(allowed) => ExecuteResponse {
                success: true,
                error: String::new(),
                allowed,
                leader_addr: String::new(),
            },
            Err(ClusterError::Command(e)) => ExecuteResponse {
                success: false,
                error: e.to_string(),
                allowed: false,
                leader_addr: String::new(),
            },
            Err(ClusterError::NotLeader { leader_addr, .. }) => ExecuteResponse {
                success: false,
                error: "not the leader".to_string(),
                allowed: false,
                leader_addr,
            },
            Err(ClusterError::Timeout { .. }) => {
                return Err(Status::deadline_exceeded(
                    "timed out waiting for the command to apply; it may still be applied",
                ));
            }
            Err(e @ (ClusterError::InvalidRequest(_) | ClusterError::Protocol(_))) => {
                return Err(Status::invalid_argument(e.to_string()));
            }
            Err(other) => return Err(Status::internal(other.to_string())),
        };
        Ok(Response::new(response))
    }

    async fn get_status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let stats = self.store.stats().await;
        let leader_id = stats.leader_id.unwrap_or(0);

        let members = stats
            .members
            .into_iter()
            .map(|member| NodeInfo {
                node_id: member.node_id,
                address: member.address,
                is_leader: member.node_id == leader_id,
                voter: member.voter,
            })
            .collect();

        Ok(Response::new(StatusResponse {
            node_id: stats.node_id,
            state: stats.state.to_string(),
            leader_id,
            term: stats.term,
            last_log_index: stats.last_log_index,
            last_applied: stats.last_applied,
            snapshot_index: stats.snapshot_index,
            namespaces: stats.namespaces as u64,
            members,
            api_addrs: stats.api_addrs.into_iter().collect(),
        }))
    }

    async fn join(&self, request: Request<JoinRequest>) -> Result<Response<JoinResponse>, Status> {
        let req = request.into_inner();

        tracing::info!(
            node_id = req.node_id,
            addr = %req.address,
            source_ip = %req.source_ip,
            voter = req.voter,
            "join request"
        );

        let metadata = req.metadata.into_iter().collect();
        let response = match self
            .store
            .join(req.node_id, &req.address, req.voter, metadata)
            .await
        {
            Ok(()) => JoinResponse {
                accepted: true,
                error: String::new(),
                leader_addr: String::new(),
            },
            Err(e) => {
                let (error, leader_addr) = describe(&e);
                if leader_addr.is_empty() {
                    tracing::warn!(node_id = req.node_id, error = %e, "join rejected");
                }
                JoinResponse {
                    accepted: false,
                    error,
                    leader_addr,
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn remove_node(
        &self,
        request: Request<RemoveNodeRequest>,
    ) -> Result<Response<RemoveNodeResponse>, Status> {
        let req = request.into_inner();

        tracing::info!(node_id = req.node_id, "removing node from cluster");

        let response = match self.store.remove(req.node_id).await {
            Ok(()) => RemoveNodeResponse {
                success: true,
                error: String::new(),
                leader_addr: String::new(),
            },
            Err(e) => {
                let (error, leader_addr) = describe(&e);
                RemoveNodeResponse {
                    success: false,
                    error,
                    leader_addr,
                }
            }
        };
        Ok(Response::new(response))
    }
}
