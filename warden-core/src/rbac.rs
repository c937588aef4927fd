//! Role hierarchy derived from grouping rules.
//!
//! A [`RoleGraph`] is a cache: it is never serialized and is always rebuilt
//! from the rows of a grouping assertion (see
//! [`Assertion::build_role_links`](crate::Assertion::build_role_links)).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Default maximum inheritance depth followed by [`RoleGraph::has_link`].
pub const DEFAULT_MAX_HIERARCHY_LEVEL: usize = 10;

/// Directed subject → role links, partitioned by domain.
///
/// Links without a domain live in the `""` partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGraph {
    max_hierarchy_level: usize,
    links: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl Default for RoleGraph {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HIERARCHY_LEVEL)
    }
}

impl RoleGraph {
    /// Create an empty graph following at most `max_hierarchy_level` hops.
    pub fn new(max_hierarchy_level: usize) -> Self {
        Self {
            max_hierarchy_level,
            links: BTreeMap::new(),
        }
    }

    /// Record that `name1` inherits `name2` (optionally within `domain`).
    pub fn add_link(&mut self, name1: &str, name2: &str, domain: Option<&str>) {
        self.links
            .entry(domain.unwrap_or_default().to_string())
            .or_default()
            .entry(name1.to_string())
            .or_default()
            .insert(name2.to_string());
    }

    /// Remove a single link. Returns whether it existed.
    pub fn delete_link(&mut self, name1: &str, name2: &str, domain: Option<&str>) -> bool {
        let domain = domain.unwrap_or_default();
        let Some(edges) = self.links.get_mut(domain) else {
            return false;
        };
        let removed = edges
            .get_mut(name1)
            .map(|roles| roles.remove(name2))
            .unwrap_or(false);
        if edges.get(name1).is_some_and(BTreeSet::is_empty) {
            edges.remove(name1);
        }
        if edges.is_empty() {
            self.links.remove(domain);
        }
        removed
    }

    /// Whether `name1` reaches `name2` within the hierarchy depth limit.
    ///
    /// A name always reaches itself.
    pub fn has_link(&self, name1: &str, name2: &str, domain: Option<&str>) -> bool {
        if name1 == name2 {
            return true;
        }
        let Some(edges) = self.links.get(domain.unwrap_or_default()) else {
            return false;
        };

        let mut seen = BTreeSet::from([name1]);
        let mut queue = VecDeque::from([(name1, 0usize)]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= self.max_hierarchy_level {
                continue;
            }
            let Some(roles) = edges.get(current) else {
                continue;
            };
            for role in roles {
                if role == name2 {
                    return true;
                }
                if seen.insert(role.as_str()) {
                    queue.push_back((role.as_str(), depth + 1));
                }
            }
        }
        false
    }

    /// Roles directly assigned to `name`.
    pub fn roles_for(&self, name: &str, domain: Option<&str>) -> Vec<String> {
        self.links
            .get(domain.unwrap_or_default())
            .and_then(|edges| edges.get(name))
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of links across all domains.
    pub fn len(&self) -> usize {
        self.links
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeSet::len)
            .sum()
    }

    /// Whether the graph has no links.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Drop every link.
    pub fn clear(&mut self) {
        self.links.clear();
    }
}
