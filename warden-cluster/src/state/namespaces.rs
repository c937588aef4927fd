//! Namespace → enforcer table.
//!
//! Mutated only from the ordered apply path; the log order is what keeps
//! replicas identical, so the table itself carries no lock.

use crate::command::CommandError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use warden_core::{Model, PolicyError};

/// Policy state of one namespace.
///
/// A freshly created namespace has an empty model until `SetModel` runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enforcer {
    model: Model,
}

impl Enforcer {
    /// Create an enforcer with no model.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Mutable access to the model for rule operations.
    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    /// Replace the model wholesale.
    pub fn set_model(&mut self, model: Model) {
        self.model = model;
    }

    /// Rebuild derived role graphs after deserialization.
    pub fn relink(&mut self) -> Result<(), PolicyError> {
        self.model.build_role_links()
    }
}

/// All namespaces known to this replica, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceTable {
    enforcers: BTreeMap<String, Enforcer>,
}

impl NamespaceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty enforcer for `namespace`.
    pub fn create(&mut self, namespace: &str) -> Result<(), CommandError> {
        if self.enforcers.contains_key(namespace) {
            return Err(CommandError::NamespaceExists);
        }
        self.enforcers.insert(namespace.to_string(), Enforcer::new());
        Ok(())
    }

    /// Look up an enforcer.
    pub fn get(&self, namespace: &str) -> Option<&Enforcer> {
        self.enforcers.get(namespace)
    }

    /// Look up an enforcer for mutation.
    pub fn get_mut(&mut self, namespace: &str) -> Result<&mut Enforcer, CommandError> {
        self.enforcers
            .get_mut(namespace)
            .ok_or(CommandError::NamespaceNotExist)
    }

    /// Whether `namespace` exists.
    pub fn contains(&self, namespace: &str) -> bool {
        self.enforcers.contains_key(namespace)
    }

    /// Namespace names in key order.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.enforcers.keys().map(String::as_str)
    }

    /// Number of namespaces.
    pub fn len(&self) -> usize {
        self.enforcers.len()
    }

    /// Whether no namespace exists.
    pub fn is_empty(&self) -> bool {
        self.enforcers.is_empty()
    }

    /// Serializable view for the snapshot codec.
    pub fn snapshot_view(&self) -> &BTreeMap<String, Enforcer> {
        &self.enforcers
    }

    /// Encode the table. Equal tables encode to equal bytes.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Rebuild a table from encoded form, relinking every role graph.
    ///
    /// Fails on the first namespace whose grouping rows do not fit their
    /// role definition.
    pub fn decode(bytes: &[u8]) -> Result<Self, TableDecodeError> {
        let mut table: NamespaceTable =
            serde_json::from_slice(bytes).map_err(TableDecodeError::Decode)?;
        for (namespace, enforcer) in &mut table.enforcers {
            enforcer
                .relink()
                .map_err(|source| TableDecodeError::Relink {
                    namespace: namespace.clone(),
                    source,
                })?;
        }
        Ok(table)
    }
}

/// Failure to rebuild a [`NamespaceTable`] from its encoded form.
#[derive(Debug, thiserror::Error)]
pub enum TableDecodeError {
    /// The bytes are not an encoded table.
    #[error("failed to decode namespace table: {0}")]
    Decode(#[source] serde_json::Error),

    /// A namespace's grouping rows could not be linked.
    #[error("namespace {namespace}: {source}")]
    Relink {
        /// Offending namespace.
        namespace: String,
        /// Linking error.
        source: PolicyError,
    },
}
