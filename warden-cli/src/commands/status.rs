//! Status and remove commands - talk to a running node.

use anyhow::{Context, Result, bail};
use warden_cluster::network::connect;
use warden_cluster::proto::cluster_service_client::ClusterServiceClient;
use warden_cluster::proto::{RemoveNodeRequest, StatusRequest};

async fn client(addr: &str) -> Result<ClusterServiceClient<warden_cluster::network::Channel>> {
    let channel = connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    Ok(ClusterServiceClient::new(channel))
}

/// Print a node's view of the cluster.
pub async fn run(addr: &str) -> Result<()> {
    let status = client(addr)
        .await?
        .get_status(StatusRequest {})
        .await
        .context("status request failed")?
        .into_inner();

    println!("Node:            {}", status.node_id);
    println!("State:           {}", status.state);
    match status.leader_id {
        0 => println!("Leader:          unknown"),
        id => println!("Leader:          {}", id),
    }
    println!("Term:            {}", status.term);
    println!("Last log index:  {}", status.last_log_index);
    println!("Last applied:    {}", status.last_applied);
    println!("Snapshot index:  {}", status.snapshot_index);
    println!("Namespaces:      {}", status.namespaces);
    println!();
    println!("Members:");

    let mut members = status.members;
    members.sort_by_key(|m| m.node_id);
    for member in members {
        let role = match (member.is_leader, member.voter) {
            (true, _) => "leader",
            (false, true) => "voter",
            (false, false) => "non-voter",
        };
        let api = status
            .api_addrs
            .get(&member.node_id)
            .map(String::as_str)
            .unwrap_or("-");
        println!(
            "  {:>4}  {:<22} {:<10} api {}",
            member.node_id, member.address, role, api
        );
    }

    Ok(())
}

/// Ask the cluster to remove `node_id`, following one leader redirect.
pub async fn remove(addr: &str, node_id: u64) -> Result<()> {
    let mut target = addr.to_string();
    for _ in 0..2 {
        let reply = client(&target)
            .await?
            .remove_node(RemoveNodeRequest { node_id })
            .await
            .context("remove request failed")?
            .into_inner();

        if reply.success {
            println!("Removed node {node_id}");
            return Ok(());
        }
        if reply.leader_addr.is_empty() || reply.leader_addr == target {
            bail!("failed to remove node {node_id}: {}", reply.error);
        }
        tracing::debug!(leader = %reply.leader_addr, "redirected to leader");
        target = reply.leader_addr;
    }
    bail!("failed to remove node {node_id}: leader keeps changing")
}
