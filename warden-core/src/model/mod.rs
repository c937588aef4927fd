//! Policy model: section → entry → [`Assertion`].
//!
//! Section keys follow the model text: `r` (request definition), `p`
//! (policy definition), `g` (role definition), `e` (policy effect) and
//! `m` (matchers). Entries within a section are keyed by their own name
//! (`p`, `p2`, `g`, `g2`, ...).
//!
//! Rows of `g` entries feed a derived [`RoleGraph`](crate::RoleGraph) that
//! is rebuilt after every grouping mutation and after deserialization.

mod assertion;
mod parser;

pub use assertion::{Assertion, ROW_KEY_SEPARATOR, row_key};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{PolicyError, Result};

/// Section key holding grouping (role) definitions.
pub const GROUPING_SECTION: &str = "g";

/// Section keys whose rows are cleared by [`Model::clear_policy`].
const RULE_SECTIONS: [&str; 2] = ["p", GROUPING_SECTION];

/// A parsed policy model and its rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Model {
    sections: BTreeMap<String, BTreeMap<String, Assertion>>,
}

impl Model {
    /// Parse model definition text. The returned model has no rules.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut model = Self {
            sections: parser::parse(text)?,
        };
        model.build_role_links()?;
        Ok(model)
    }

    /// Whether no section is defined (a namespace without a model yet).
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Look up an entry.
    pub fn get(&self, sec: &str, ptype: &str) -> Option<&Assertion> {
        self.sections.get(sec).and_then(|entries| entries.get(ptype))
    }

    /// All entries of a section.
    pub fn section(&self, sec: &str) -> Option<&BTreeMap<String, Assertion>> {
        self.sections.get(sec)
    }

    /// Iterate over `(section, entries)` pairs in key order.
    pub fn sections(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Assertion>)> {
        self.sections.iter()
    }

    /// Rows of an entry, or an empty slice if it does not exist.
    pub fn policy(&self, sec: &str, ptype: &str) -> &[Vec<String>] {
        self.get(sec, ptype)
            .map(|assertion| assertion.policy.as_slice())
            .unwrap_or_default()
    }

    /// Whether `row` is stored under `sec`/`ptype`.
    pub fn has_policy(&self, sec: &str, ptype: &str, row: &[String]) -> bool {
        self.get(sec, ptype)
            .is_some_and(|assertion| assertion.has_policy(row))
    }

    /// Append rows, skipping duplicates. Returns the rows added.
    pub fn add_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<Vec<Vec<String>>> {
        self.mutate(sec, ptype, |assertion| Ok(assertion.add_policies(rows)))
    }

    /// Replace `old_rows` with `new_rows` in place, all-or-nothing.
    pub fn update_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        old_rows: &[Vec<String>],
        new_rows: &[Vec<String>],
    ) -> Result<()> {
        self.mutate(sec, ptype, |assertion| {
            assertion.update_policies(old_rows, new_rows)
        })
    }

    /// Remove the listed rows. Returns the rows removed.
    pub fn remove_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rows: &[Vec<String>],
    ) -> Result<Vec<Vec<String>>> {
        self.mutate(sec, ptype, |assertion| Ok(assertion.remove_policies(rows)))
    }

    /// Remove rows whose fields from `field_index` onward match `values`.
    pub fn remove_filtered_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        field_index: usize,
        values: &[String],
    ) -> Result<Vec<Vec<String>>> {
        self.mutate(sec, ptype, |assertion| {
            Ok(assertion.remove_filtered_policy(field_index, values))
        })
    }

    /// Empty every policy and grouping entry.
    pub fn clear_policy(&mut self) {
        for sec in RULE_SECTIONS {
            if let Some(entries) = self.sections.get_mut(sec) {
                entries.values_mut().for_each(Assertion::clear);
            }
        }
    }

    /// Rebuild the role hierarchy of every grouping entry from its rows.
    pub fn build_role_links(&mut self) -> Result<()> {
        if let Some(entries) = self.sections.get_mut(GROUPING_SECTION) {
            for assertion in entries.values_mut() {
                assertion.build_role_links()?;
            }
        }
        Ok(())
    }

    /// Whether `name1` inherits `name2` through grouping entry `ptype`.
    pub fn has_link(&self, ptype: &str, name1: &str, name2: &str, domain: Option<&str>) -> bool {
        self.get(GROUPING_SECTION, ptype)
            .and_then(Assertion::role_graph)
            .is_some_and(|graph| graph.has_link(name1, name2, domain))
    }

    /// Run `f` on an entry, restoring it if `f` or the relinking fails.
    fn mutate<T>(
        &mut self,
        sec: &str,
        ptype: &str,
        f: impl FnOnce(&mut Assertion) -> Result<T>,
    ) -> Result<T> {
        let assertion = self
            .sections
            .get_mut(sec)
            .and_then(|entries| entries.get_mut(ptype))
            .ok_or_else(|| PolicyError::AssertionNotFound {
                sec: sec.to_string(),
                ptype: ptype.to_string(),
            })?;

        if sec != GROUPING_SECTION {
            return f(assertion);
        }

        let before = assertion.clone();
        let out = f(assertion)?;
        if let Err(e) = assertion.build_role_links() {
            *assertion = before;
            return Err(e);
        }
        Ok(out)
    }
}
