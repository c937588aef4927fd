//! Network layer for Raft RPC communication.
//!
//! This module implements the gRPC-based network transport for Raft messages
//! using tonic.

mod client;
mod server;

pub use client::{NetworkClient, connect};
pub use server::RaftServer;
pub use tonic::transport::Channel;
