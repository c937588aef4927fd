//! Join coordinator: asks existing members to admit this node.
//!
//! Peers are tried in order. A peer that is not the leader answers with the
//! leader's address, which is followed once before moving on. After each
//! full round without success the coordinator sleeps for the configured
//! interval, up to the configured number of rounds.

use crate::config::JoinConfig;
use crate::network::connect;
use crate::proto::JoinRequest;
use crate::proto::cluster_service_client::ClusterServiceClient;
use crate::types::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Joining failed.
#[derive(Debug, Error)]
pub enum JoinError {
    /// No peer addresses were configured.
    #[error("no join addresses provided")]
    NoPeers,

    /// Every peer was tried `attempts` times without success.
    #[error("failed to join cluster at {peers:?} after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Addresses tried.
        peers: Vec<String>,
        /// Rounds performed.
        attempts: u32,
        /// The most recent failure.
        last_error: String,
    },
}

/// Outcome of asking one peer.
enum PeerReply {
    Accepted,
    Redirect(String),
    Rejected(String),
}

/// Drives the client side of a cluster join.
#[derive(Debug, Clone)]
pub struct JoinCoordinator {
    peers: Vec<String>,
    attempts: u32,
    interval: Duration,
    source_ip: Option<String>,
    voter: bool,
}

impl JoinCoordinator {
    /// Create a coordinator from join settings.
    pub fn new(config: &JoinConfig) -> Self {
        Self {
            peers: config.peers.clone(),
            attempts: config.attempts.max(1),
            interval: config.interval(),
            source_ip: config.source_ip.clone(),
            voter: config.voter,
        }
    }

    /// Request membership for `node_id` advertised at `address`.
    ///
    /// Returns the address of the peer that accepted the request.
    pub async fn join(
        &self,
        node_id: NodeId,
        address: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, JoinError> {
        if self.peers.is_empty() {
            return Err(JoinError::NoPeers);
        }

        let request = JoinRequest {
            source_ip: self.source_ip.clone().unwrap_or_default(),
            node_id,
            address: address.to_string(),
            voter: self.voter,
            metadata: metadata.into_iter().collect::<HashMap<_, _>>(),
        };

        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            for peer in &self.peers {
                match self.try_peer(peer, &request).await {
                    Ok(accepted) => {
                        tracing::info!(node_id, peer = %accepted, attempt, "joined cluster");
                        return Ok(accepted);
                    }
                    Err(e) => {
                        tracing::warn!(node_id, %peer, attempt, error = %e, "join attempt failed");
                        last_error = e;
                    }
                }
            }

            if attempt < self.attempts {
                tracing::info!(
                    interval = ?self.interval,
                    "failed to join cluster, sleeping before retry"
                );
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(JoinError::Exhausted {
            peers: self.peers.clone(),
            attempts: self.attempts,
            last_error,
        })
    }

    /// Ask `peer`, following one leader redirect.
    async fn try_peer(&self, peer: &str, request: &JoinRequest) -> Result<String, String> {
        match ask(peer, request).await? {
            PeerReply::Accepted => Ok(peer.to_string()),
            PeerReply::Rejected(error) => Err(error),
            PeerReply::Redirect(leader) => {
                tracing::debug!(%peer, %leader, "join redirected to leader");
                match ask(&leader, request).await? {
                    PeerReply::Accepted => Ok(leader),
                    PeerReply::Rejected(error) => Err(error),
                    PeerReply::Redirect(next) => {
                        Err(format!("{leader} is not the leader either (points to {next})"))
                    }
                }
            }
        }
    }
}

async fn ask(peer: &str, request: &JoinRequest) -> Result<PeerReply, String> {
    let channel = connect(peer).await.map_err(|e| e.to_string())?;
    let reply = ClusterServiceClient::new(channel)
        .join(request.clone())
        .await
        .map_err(|status| status.message().to_string())?
        .into_inner();

    Ok(if reply.accepted {
        PeerReply::Accepted
    } else if !reply.leader_addr.is_empty() && reply.leader_addr != peer {
        PeerReply::Redirect(reply.leader_addr)
    } else if reply.error.is_empty() {
        PeerReply::Rejected(format!("{peer} rejected the join request"))
    } else {
        PeerReply::Rejected(reply.error)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_peers() {
        let coordinator = JoinCoordinator::new(&JoinConfig::default());
        let err = coordinator
            .join(2, "127.0.0.1:1", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::NoPeers));
    }

    #[tokio::test]
    async fn test_unreachable_peers_exhaust_attempts() {
        let config = JoinConfig {
            attempts: 2,
            interval_ms: 10,
            ..JoinConfig::with_peers(vec!["127.0.0.1:1".to_string()])
        };
        let err = JoinCoordinator::new(&config)
            .join(2, "127.0.0.1:2", BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            JoinError::Exhausted {
                attempts, peers, ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(peers, vec!["127.0.0.1:1".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
