//! CLI command implementations.

pub mod serve;
pub mod status;
pub mod version;
