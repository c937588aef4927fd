//! Response and snapshot types for the state machine.

use crate::command::CommandError;
use crate::types::WardenSnapshotMeta;
use serde::{Deserialize, Serialize};

/// Response from applying one command.
///
/// Mutating commands only use `error`; enforce commands also set `allowed`.
/// The caller knows which kind it submitted, so the response carries no tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResponse {
    /// Request-level error, if the command was rejected.
    pub error: Option<CommandError>,
    /// Decision of an enforce command.
    pub allowed: bool,
}

impl StoreResponse {
    /// Create a success response.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Create an error response.
    pub fn err(error: CommandError) -> Self {
        Self {
            error: Some(error),
            allowed: false,
        }
    }

    /// Create a decision response.
    pub fn decision(allowed: bool) -> Self {
        Self {
            error: None,
            allowed,
        }
    }

    /// Convert a mutating command's response into a result.
    pub fn into_result(self) -> Result<(), CommandError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Convert an enforce command's response into a decision.
    pub fn into_decision(self) -> Result<bool, CommandError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.allowed),
        }
    }
}

impl From<Result<(), CommandError>> for StoreResponse {
    fn from(result: Result<(), CommandError>) -> Self {
        match result {
            Ok(()) => StoreResponse::ok(),
            Err(e) => StoreResponse::err(e),
        }
    }
}

/// Snapshot held in memory for serving to lagging followers.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    /// Snapshot metadata.
    pub meta: WardenSnapshotMeta,
    /// Encoded [`SnapshotDocument`](crate::state::SnapshotDocument).
    pub data: Vec<u8>,
}
