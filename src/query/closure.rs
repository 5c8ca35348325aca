//! Transitive membership over the base caches.
//!
//! Both directions walk the nested-groups graph with a visited set, so cyclic
//! nesting terminates and every group is expanded at most once.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::cache::{CacheReader, DIRECT_MEMBERS, NESTED_GROUPS, USER_GROUPS};
use crate::directory::dn;
use crate::error::Result;
use crate::storage::Values;

// == Nested Parents ==
/// Reverse of the nested-groups cache: subgroup → groups nesting it.
#[derive(Debug, Default)]
pub struct NestedParents {
    parents: BTreeMap<String, Vec<String>>,
}

impl NestedParents {
    /// Builds the reverse map with a single scan of nested-groups.
    ///
    /// The caches hold no subgroup → parent lookup, so the cost grows with
    /// the whole nested-groups cache, not with the answer. Nested
    /// `groups_for_user` pays it per call and ingestion once per event;
    /// `QueryFrontend::effective_groups` reads the materialized result instead.
    pub fn load(reader: &dyn CacheReader) -> Result<Self> {
        let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut scanned = 0usize;
        if reader.has_cache(NESTED_GROUPS) {
            for (group, subgroups) in reader.scan(NESTED_GROUPS)? {
                scanned += 1;
                for subgroup in subgroups {
                    parents.entry(subgroup).or_default().push(group.clone());
                }
            }
        }
        debug!(groups = scanned, subgroups = parents.len(), "nested-groups scanned for parents");
        Ok(Self { parents })
    }

    /// Number of subgroups with at least one parent.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// `direct` plus every group reachable upwards from it.
    pub fn expand(&self, direct: Values) -> Values {
        let mut result = direct;
        let mut visited: HashSet<String> = result.iter().cloned().collect();
        let mut frontier: Vec<String> = result.iter().cloned().collect();

        while let Some(group) = frontier.pop() {
            let Some(parents) = self.parents.get(&group) else {
                continue;
            };
            for parent in parents {
                if visited.insert(parent.clone()) {
                    result.insert(parent.clone());
                    frontier.push(parent.clone());
                }
            }
        }
        result
    }
}

// == Groups For User ==
/// Groups `user_dn` belongs to, directly or (when `nested`) through nesting.
///
/// # Arguments
/// * `reader` - Cache view; needs user-groups, and nested-groups when nested
/// * `user_dn` - User DN in any case/spacing
/// * `nested` - Follow nested-groups upwards
pub fn groups_for_user(reader: &dyn CacheReader, user_dn: &str, nested: bool) -> Result<Values> {
    let direct = reader.get(USER_GROUPS, &dn::normalize(user_dn))?;
    if !nested || direct.is_empty() {
        return Ok(direct);
    }
    Ok(NestedParents::load(reader)?.expand(direct))
}

// == Users In Group ==
/// Users that are members of `group_dn`, directly or (when `nested`) through
/// any of its subgroups.
pub fn users_in_group(reader: &dyn CacheReader, group_dn: &str, nested: bool) -> Result<Values> {
    let root = dn::normalize(group_dn);
    let mut users = reader.get(DIRECT_MEMBERS, &root)?;
    if !nested {
        return Ok(users);
    }

    let mut visited: HashSet<String> = HashSet::from([root.clone()]);
    let mut frontier = vec![root];
    while let Some(group) = frontier.pop() {
        for subgroup in reader.get(NESTED_GROUPS, &group)? {
            if visited.insert(subgroup.clone()) {
                users.extend(reader.get(DIRECT_MEMBERS, &subgroup)?);
                frontier.push(subgroup);
            }
        }
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Caches = BTreeMap<String, BTreeMap<String, Values>>;

    fn set(items: &[&str]) -> Values {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn caches(direct: &[(&str, &[&str])], nested: &[(&str, &[&str])]) -> Caches {
        let to_map = |pairs: &[(&str, &[&str])]| -> BTreeMap<String, Values> {
            pairs.iter().map(|(k, v)| (k.to_string(), set(v))).collect()
        };
        let direct = to_map(direct);
        let mut user_groups: BTreeMap<String, Values> = BTreeMap::new();
        for (group, users) in &direct {
            for user in users {
                user_groups
                    .entry(user.clone())
                    .or_default()
                    .insert(group.clone());
            }
        }
        BTreeMap::from([
            (DIRECT_MEMBERS.to_string(), direct),
            (NESTED_GROUPS.to_string(), to_map(nested)),
            (USER_GROUPS.to_string(), user_groups),
        ])
    }

    #[test]
    fn test_chain_resolution() {
        // g3 ⊂ g2 ⊂ g1, u in g3
        let c = caches(&[("g3", &["u"])], &[("g1", &["g2"]), ("g2", &["g3"])]);
        assert_eq!(groups_for_user(&c, "u", true).unwrap(), set(&["g1", "g2", "g3"]));
        assert_eq!(groups_for_user(&c, "u", false).unwrap(), set(&["g3"]));
        assert_eq!(users_in_group(&c, "g1", true).unwrap(), set(&["u"]));
        assert!(users_in_group(&c, "g1", false).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_terminates() {
        let c = caches(
            &[("a", &["u1"]), ("b", &["u2"])],
            &[("a", &["b"]), ("b", &["a"])],
        );
        assert_eq!(groups_for_user(&c, "u1", true).unwrap(), set(&["a", "b"]));
        assert_eq!(users_in_group(&c, "a", true).unwrap(), set(&["u1", "u2"]));
        assert_eq!(users_in_group(&c, "b", true).unwrap(), set(&["u1", "u2"]));
    }

    #[test]
    fn test_self_nesting() {
        let c = caches(&[("a", &["u"])], &[("a", &["a"])]);
        assert_eq!(groups_for_user(&c, "u", true).unwrap(), set(&["a"]));
        assert_eq!(users_in_group(&c, "a", true).unwrap(), set(&["u"]));
    }

    #[test]
    fn test_unknown_dns_yield_empty_sets() {
        let c = caches(&[], &[]);
        assert!(groups_for_user(&c, "uid=nobody", true).unwrap().is_empty());
        assert!(users_in_group(&c, "cn=nothing", true).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_normalizes_dn() {
        let c = caches(&[("cn=g,dc=x", &["uid=u,dc=x"])], &[]);
        assert_eq!(
            groups_for_user(&c, "UID=U, DC=X", false).unwrap(),
            set(&["cn=g,dc=x"])
        );
        assert_eq!(
            users_in_group(&c, "CN=G,DC=X", true).unwrap(),
            set(&["uid=u,dc=x"])
        );
    }

    #[test]
    fn test_diamond_counts_once() {
        let c = caches(
            &[("d", &["u"])],
            &[("top", &["l", "r"]), ("l", &["d"]), ("r", &["d"])],
        );
        assert_eq!(
            groups_for_user(&c, "u", true).unwrap(),
            set(&["d", "l", "r", "top"])
        );
    }

    #[test]
    fn test_nested_parents_reverse_every_edge() {
        let caches = caches(&[], &[("g2", &["g1"]), ("g3", &["g2"])]);
        let parents = NestedParents::load(&caches).unwrap();
        assert_eq!(parents.len(), 2);
        assert_eq!(parents.expand(set(&["g1"])), set(&["g1", "g2", "g3"]));

        let empty = NestedParents::load(&Caches::new()).unwrap();
        assert!(empty.is_empty());
    }
}
