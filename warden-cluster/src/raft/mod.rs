//! Raft integration module.
//!
//! This module provides the [`Store`] which ties together:
//! - Log storage (RaftLogStorage)
//! - State machine (StateMachineStore)
//! - Network (RaftNetwork)
//! - The Raft instance itself and its snapshot ticker

mod log_store;
mod store;
mod ticker;

pub use log_store::LogStore;
pub use store::{API_ADDR_KEY, API_PROTO_KEY, ApplyOutcome, MemberInfo, Store, StoreStats};
pub use ticker::{SnapshotTicker, snapshot_due};
