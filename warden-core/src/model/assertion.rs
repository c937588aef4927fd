//! Rule storage for one section entry of a model.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PolicyError, Result};
use crate::rbac::RoleGraph;

/// Separator used to build `policy_map` keys from rule fields.
pub const ROW_KEY_SEPARATOR: &str = ",";

/// One entry of a model section, e.g. `p` or `g2`.
///
/// `policy` holds the rows in insertion order and `policy_map` maps the
/// joined row to its position in `policy`. Both are rewritten together by
/// every mutation; rows are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    /// Entry key (`r`, `p`, `g`, `e`, `m`, `p2`, ...).
    pub key: String,
    /// Raw definition expression from the model text.
    pub value: String,
    /// Field tokens (`p_sub`, `p_obj`, ...) for request/policy definitions.
    pub tokens: Vec<String>,
    /// Rule rows.
    pub policy: Vec<Vec<String>>,
    /// Joined row → index into `policy`.
    pub policy_map: BTreeMap<String, usize>,
    /// Derived role hierarchy for grouping entries.
    #[serde(skip)]
    role_graph: Option<RoleGraph>,
}

/// Join a row into its `policy_map` key.
pub fn row_key(row: &[String]) -> String {
    row.join(ROW_KEY_SEPARATOR)
}

impl Assertion {
    /// Create an assertion with no rows.
    pub fn new(key: impl Into<String>, value: impl Into<String>, tokens: Vec<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            tokens,
            ..Default::default()
        }
    }

    /// Whether `row` is stored.
    pub fn has_policy(&self, row: &[String]) -> bool {
        self.policy_map.contains_key(&row_key(row))
    }

    /// Number of operands in a role definition (`_, _` → 2).
    pub fn operand_count(&self) -> usize {
        self.value.matches('_').count()
    }

    /// The role hierarchy, if this assertion has been linked.
    pub fn role_graph(&self) -> Option<&RoleGraph> {
        self.role_graph.as_ref()
    }

    /// Append the rows that are not already stored.
    ///
    /// Duplicates, against existing rows or within `rows`, are skipped.
    /// Returns the rows that were actually added.
    pub fn add_policies(&mut self, rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
        let mut added = Vec::new();
        for row in rows {
            let key = row_key(&row);
            if self.policy_map.contains_key(&key) {
                continue;
            }
            self.policy_map.insert(key, self.policy.len());
            self.policy.push(row.clone());
            added.push(row);
        }
        added
    }

    /// Remove every stored row listed in `rows`, preserving the order of the
    /// remaining rows. Rows that are not stored are ignored.
    pub fn remove_policies(&mut self, rows: &[Vec<String>]) -> Vec<Vec<String>> {
        let doomed: BTreeSet<String> = rows
            .iter()
            .map(|row| row_key(row))
            .filter(|key| self.policy_map.contains_key(key))
            .collect();
        if doomed.is_empty() {
            return Vec::new();
        }

        let mut removed = Vec::new();
        self.policy.retain(|row| {
            if doomed.contains(&row_key(row)) {
                removed.push(row.clone());
                false
            } else {
                true
            }
        });
        self.rebuild_index();
        removed
    }

    /// Remove rows whose fields starting at `field_index` equal `values`.
    ///
    /// An empty string in `values` matches any field value, and an empty
    /// `values` matches every row long enough to reach `field_index`. Rows
    /// too short to hold `field_index + values.len()` fields never match.
    pub fn remove_filtered_policy(
        &mut self,
        field_index: usize,
        values: &[String],
    ) -> Vec<Vec<String>> {
        let mut removed = Vec::new();
        self.policy.retain(|row| {
            if row_matches_filter(row, field_index, values) {
                removed.push(row.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.rebuild_index();
        }
        removed
    }

    /// Replace each of `old_rows` in place with the matching entry of
    /// `new_rows`.
    ///
    /// All-or-nothing: every old row must exist and appear once, and the
    /// result must not contain duplicates, otherwise the assertion is left
    /// unchanged.
    pub fn update_policies(
        &mut self,
        old_rows: &[Vec<String>],
        new_rows: &[Vec<String>],
    ) -> Result<()> {
        if old_rows.len() != new_rows.len() {
            return Err(PolicyError::UpdateLengthMismatch {
                old: old_rows.len(),
                new: new_rows.len(),
            });
        }

        let mut targets = BTreeSet::new();
        for old in old_rows {
            if !targets.insert(row_key(old)) {
                return Err(PolicyError::DuplicateRule(old.clone()));
            }
        }

        let mut updated = self.policy.clone();
        for (old, new) in old_rows.iter().zip(new_rows) {
            let index = *self
                .policy_map
                .get(&row_key(old))
                .ok_or_else(|| PolicyError::RuleNotFound(old.clone()))?;
            updated[index] = new.clone();
        }

        let mut seen = BTreeSet::new();
        for row in &updated {
            if !seen.insert(row_key(row)) {
                return Err(PolicyError::DuplicateRule(row.clone()));
            }
        }

        self.policy = updated;
        self.rebuild_index();
        Ok(())
    }

    /// Drop every row.
    pub fn clear(&mut self) {
        self.policy.clear();
        self.policy_map.clear();
        if let Some(graph) = self.role_graph.as_mut() {
            graph.clear();
        }
    }

    /// Recompute `policy_map` from `policy`.
    pub fn rebuild_index(&mut self) {
        self.policy_map = self
            .policy
            .iter()
            .enumerate()
            .map(|(index, row)| (row_key(row), index))
            .collect();
    }

    /// Rebuild the role hierarchy by replaying every row as a link.
    ///
    /// Rows shorter than the role definition are rejected. Longer rows are
    /// truncated to the definition's arity before linking; the truncated
    /// fields are logged and otherwise ignored.
    pub fn build_role_links(&mut self) -> Result<()> {
        let count = self.operand_count();
        let mut graph = RoleGraph::default();

        for row in &self.policy {
            if row.len() < count || count < 2 {
                return Err(PolicyError::MalformedGroupingRow {
                    row: row.clone(),
                    expected: count,
                });
            }
            if row.len() > count {
                tracing::warn!(
                    key = %self.key,
                    ?row,
                    expected = count,
                    "truncating grouping row longer than its role definition"
                );
            }
            let row = &row[..count];
            graph.add_link(&row[0], &row[1], row.get(2).map(String::as_str));
        }

        self.role_graph = Some(graph);
        Ok(())
    }
}

fn row_matches_filter(row: &[String], field_index: usize, values: &[String]) -> bool {
    if row.len() < field_index + values.len() {
        return false;
    }
    values
        .iter()
        .zip(&row[field_index..])
        .all(|(want, have)| want.is_empty() || want == have)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn policy_assertion() -> Assertion {
        Assertion::new(
            "p",
            "sub, obj, act",
            vec!["p_sub".into(), "p_obj".into(), "p_act".into()],
        )
    }

    /// The index holds exactly one entry per row, pointing at that row.
    fn assert_index_consistent(assertion: &Assertion) {
        assert_eq!(assertion.policy_map.len(), assertion.policy.len());
        for (index, stored) in assertion.policy.iter().enumerate() {
            assert_eq!(assertion.policy_map.get(&row_key(stored)), Some(&index));
        }
    }

    #[test]
    fn test_add_skips_duplicates() {
        let mut a = policy_assertion();
        let added = a.add_policies(vec![
            row(&["alice", "data1", "read"]),
            row(&["alice", "data1", "read"]),
            row(&["bob", "data2", "write"]),
        ]);
        assert_eq!(added.len(), 2);

        let added = a.add_policies(vec![row(&["bob", "data2", "write"])]);
        assert!(added.is_empty());
        assert_eq!(a.policy.len(), 2);
        assert_index_consistent(&a);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut a = policy_assertion();
        a.add_policies(vec![
            row(&["a", "1", "r"]),
            row(&["b", "2", "r"]),
            row(&["c", "3", "r"]),
        ]);

        let removed = a.remove_policies(&[row(&["b", "2", "r"]), row(&["zz", "9", "r"])]);
        assert_eq!(removed, vec![row(&["b", "2", "r"])]);
        assert_eq!(a.policy, vec![row(&["a", "1", "r"]), row(&["c", "3", "r"])]);
        assert_index_consistent(&a);
    }

    #[test]
    fn test_update_in_place() {
        let mut a = policy_assertion();
        a.add_policies(vec![
            row(&["a", "1", "r"]),
            row(&["b", "2", "r"]),
            row(&["c", "3", "r"]),
        ]);

        a.update_policies(&[row(&["b", "2", "r"])], &[row(&["b", "2", "w"])])
            .expect("update should succeed");
        assert_eq!(a.policy[1], row(&["b", "2", "w"]));
        assert!(!a.has_policy(&row(&["b", "2", "r"])));
        assert_index_consistent(&a);
    }

    #[test]
    fn test_update_missing_rule_is_atomic() {
        let mut a = policy_assertion();
        a.add_policies(vec![row(&["a", "1", "r"]), row(&["b", "2", "r"])]);
        let before = a.clone();

        let err = a
            .update_policies(
                &[row(&["a", "1", "r"]), row(&["missing", "x", "r"])],
                &[row(&["a", "1", "w"]), row(&["y", "y", "y"])],
            )
            .unwrap_err();
        assert_eq!(err, PolicyError::RuleNotFound(row(&["missing", "x", "r"])));
        assert_eq!(a, before);
    }

    #[test]
    fn test_update_rejects_collision() {
        let mut a = policy_assertion();
        a.add_policies(vec![row(&["a", "1", "r"]), row(&["b", "2", "r"])]);

        let err = a
            .update_policies(&[row(&["a", "1", "r"])], &[row(&["b", "2", "r"])])
            .unwrap_err();
        assert!(matches!(err, PolicyError::DuplicateRule(_)));
        assert_index_consistent(&a);
    }

    #[test]
    fn test_update_swap_is_allowed() {
        let mut a = policy_assertion();
        a.add_policies(vec![row(&["a", "1", "r"]), row(&["b", "2", "r"])]);

        a.update_policies(
            &[row(&["a", "1", "r"]), row(&["b", "2", "r"])],
            &[row(&["b", "2", "r"]), row(&["a", "1", "r"])],
        )
        .expect("swap should succeed");
        assert_eq!(a.policy[0], row(&["b", "2", "r"]));
        assert_index_consistent(&a);
    }

    #[test]
    fn test_remove_filtered_prefix_match() {
        let mut a = policy_assertion();
        a.add_policies(vec![
            row(&["alice", "data1", "read"]),
            row(&["alice", "data1", "write"]),
            row(&["bob", "data1", "read"]),
            row(&["carol"]),
        ]);

        let removed = a.remove_filtered_policy(1, &row(&["data1", "read"]));
        assert_eq!(
            removed,
            vec![row(&["alice", "data1", "read"]), row(&["bob", "data1", "read"])]
        );
        assert_eq!(
            a.policy,
            vec![row(&["alice", "data1", "write"]), row(&["carol"])]
        );
        assert_index_consistent(&a);
    }

    #[test]
    fn test_remove_filtered_empty_value_is_wildcard() {
        let mut a = policy_assertion();
        a.add_policies(vec![
            row(&["alice", "data1", "read"]),
            row(&["bob", "data2", "read"]),
            row(&["bob", "data2", "write"]),
        ]);

        let removed = a.remove_filtered_policy(0, &row(&["", "", "read"]));
        assert_eq!(removed.len(), 2);
        assert_eq!(a.policy, vec![row(&["bob", "data2", "write"])]);
        assert_index_consistent(&a);
    }

    #[test]
    fn test_remove_filtered_no_values_matches_every_row() {
        let mut a = policy_assertion();
        a.add_policies(vec![
            row(&["alice", "data1", "read"]),
            row(&["bob", "data2", "write"]),
        ]);

        let removed = a.remove_filtered_policy(0, &[]);
        assert_eq!(removed.len(), 2);
        assert!(a.policy.is_empty());
        assert_index_consistent(&a);
    }

    #[test]
    fn test_update_rejects_repeated_old_row() {
        let mut a = policy_assertion();
        a.add_policies(vec![row(&["alice", "d", "read"]), row(&["bob", "d", "write"])]);
        let before = a.clone();

        let err = a
            .update_policies(
                &[row(&["alice", "d", "read"]), row(&["alice", "d", "read"])],
                &[row(&["x", "d", "read"]), row(&["y", "d", "read"])],
            )
            .unwrap_err();
        assert_eq!(err, PolicyError::DuplicateRule(row(&["alice", "d", "read"])));
        assert_eq!(a, before);
        assert_index_consistent(&a);
    }

    #[test]
    fn test_role_links_reject_short_rows() {
        let mut g = Assertion::new("g", "_, _", Vec::new());
        g.add_policies(vec![row(&["alice"])]);

        let err = g.build_role_links().unwrap_err();
        assert!(matches!(err, PolicyError::MalformedGroupingRow { expected: 2, .. }));
    }

    #[test]
    fn test_role_links_truncate_long_rows() {
        let mut g = Assertion::new("g", "_, _", Vec::new());
        g.add_policies(vec![row(&["alice", "admin", "extra"])]);

        g.build_role_links().expect("long rows are truncated");
        let graph = g.role_graph().expect("graph built");
        assert!(graph.has_link("alice", "admin", None));
        assert!(!graph.has_link("alice", "admin", Some("extra")));
    }

    #[test]
    fn test_role_graph_not_serialized() {
        let mut g = Assertion::new("g", "_, _", Vec::new());
        g.add_policies(vec![row(&["alice", "admin"])]);
        g.build_role_links().expect("link");

        let json = serde_json::to_string(&g).expect("serialize");
        let back: Assertion = serde_json::from_str(&json).expect("deserialize");
        assert!(back.role_graph().is_none());
        assert_eq!(back.policy, g.policy);
        assert_eq!(back.policy_map, g.policy_map);
    }
}
