//! Cluster service for command submission, status and membership.
//!
//! Peers use it to join and follow leader redirects; operators use it to
//! inspect a node and submit commands.

mod cluster;

pub use cluster::ClusterServiceImpl;
