//! Membership Index Module
//!
//! Records, for every group, its ordered list of direct members (users and
//! subgroups), and for every member the groups listing it. Ingestion uses it
//! to find the users below a group whose nesting changed without scanning
//! whole caches.
//!
//! The index is an optimization. It carries the ingest generation it
//! reflects; when that does not match the stored generation, or it was marked
//! stale, callers fall back to the caches.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheReader, DIRECT_MEMBERS, NESTED_GROUPS};
use crate::error::{CacheError, Result};

const INDEX_NAME: &str = "membership-index";

// == Member Kind ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    User,
    Group,
}

// == Membership Edge ==
/// One `(group, member)` relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEdge {
    pub group_dn: String,
    pub member_dn: String,
    pub member_kind: MemberKind,
}

// == Member ==
/// One direct member of a group. The same DN may be listed as a user by one
/// group and as a subgroup by another, so the kind belongs to the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub dn: String,
    pub kind: MemberKind,
}

// == Membership Index ==
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MembershipIndex {
    /// Ingest generation this index reflects
    generation: u64,
    saved_at: Option<DateTime<Utc>>,
    /// Group → direct members in insertion order
    members: BTreeMap<String, Vec<Member>>,
    /// Member → groups listing it, as user or subgroup
    groups_of: BTreeMap<String, BTreeSet<String>>,
    #[serde(skip)]
    stale: bool,
    #[serde(skip)]
    dirty: bool,
}

impl MembershipIndex {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the index from the direct-members and nested-groups caches.
    /// Caches missing from `reader` contribute no edges.
    pub fn from_reader(reader: &dyn CacheReader) -> Result<Self> {
        let mut index = Self::new();
        if reader.has_cache(DIRECT_MEMBERS) {
            for (group, users) in reader.scan(DIRECT_MEMBERS)? {
                for user in users {
                    index.add(&group, &user, MemberKind::User);
                }
            }
        }
        if reader.has_cache(NESTED_GROUPS) {
            for (group, subgroups) in reader.scan(NESTED_GROUPS)? {
                for subgroup in subgroups {
                    index.add(&group, &subgroup, MemberKind::Group);
                }
            }
        }
        Ok(index)
    }

    // == Add ==
    /// Records that `member` is a direct member of `group`. Adding an
    /// existing edge keeps its position.
    ///
    /// # Arguments
    /// * `group` - Normalized group DN
    /// * `member` - Normalized member DN
    /// * `kind` - Whether this group lists the member as a user or a subgroup
    pub fn add(&mut self, group: &str, member: &str, kind: MemberKind) {
        let list = self.members.entry(group.to_string()).or_default();
        if !list.iter().any(|m| m.dn == member && m.kind == kind) {
            list.push(Member {
                dn: member.to_string(),
                kind,
            });
        }
        self.groups_of
            .entry(member.to_string())
            .or_default()
            .insert(group.to_string());
        self.dirty = true;
    }

    /// Drops every edge from `group` to `member`, whatever its kind.
    pub fn remove(&mut self, group: &str, member: &str) {
        self.remove_where(group, member, |_| true);
    }

    /// Drops the `(group, member)` edge of one kind, if present.
    pub fn remove_edge(&mut self, group: &str, member: &str, kind: MemberKind) {
        self.remove_where(group, member, |k| k == kind);
    }

    fn remove_where(&mut self, group: &str, member: &str, matches: impl Fn(MemberKind) -> bool) {
        let mut still_listed = false;
        if let Some(list) = self.members.get_mut(group) {
            list.retain(|m| m.dn != member || !matches(m.kind));
            still_listed = list.iter().any(|m| m.dn == member);
            if list.is_empty() {
                self.members.remove(group);
            }
        }
        if !still_listed {
            if let Some(groups) = self.groups_of.get_mut(member) {
                groups.remove(group);
                if groups.is_empty() {
                    self.groups_of.remove(member);
                }
            }
        }
        self.dirty = true;
    }

    // == Relevant For Group ==
    /// Direct members of `group` in the order they were recorded.
    pub fn relevant_for_group(&self, group: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.members
            .get(group)
            .into_iter()
            .flatten()
            .filter(|m| seen.insert(m.dn.as_str()))
            .map(|m| m.dn.clone())
            .collect()
    }

    /// Groups listing `member` directly, as user or subgroup.
    pub fn groups_of(&self, member: &str) -> BTreeSet<String> {
        self.groups_of.get(member).cloned().unwrap_or_default()
    }

    /// Kind of the `(group, member)` edge. A user reference the directory
    /// also lists as a subgroup elsewhere keeps `User` here.
    pub fn kind_of(&self, group: &str, member: &str) -> Option<MemberKind> {
        self.members
            .get(group)?
            .iter()
            .find(|m| m.dn == member)
            .map(|m| m.kind)
    }

    /// Groups listing `member` through an edge of `kind`.
    fn groups_of_kind(&self, member: &str, kind: MemberKind) -> BTreeSet<String> {
        self.groups_of(member)
            .into_iter()
            .filter(|group| {
                self.members
                    .get(group)
                    .is_some_and(|list| list.iter().any(|m| m.dn == member && m.kind == kind))
            })
            .collect()
    }

    // == Update User Cache ==
    /// Replaces the set of groups listing `user` directly as a user. Edges
    /// naming the same DN as a subgroup are left alone.
    pub fn update_user_cache<I>(&mut self, user: &str, groups: I)
    where
        I: IntoIterator<Item = String>,
    {
        let wanted: BTreeSet<String> = groups.into_iter().collect();
        let current = self.groups_of_kind(user, MemberKind::User);

        for group in current.difference(&wanted) {
            self.remove_edge(group, user, MemberKind::User);
        }
        for group in wanted.difference(&current) {
            self.add(group, user, MemberKind::User);
        }
    }

    // == Replace Members ==
    /// Replaces every direct member of `group`. Edges kept from before keep
    /// their position; new ones are appended in the given order.
    pub fn replace_members<I>(&mut self, group: &str, members: I)
    where
        I: IntoIterator<Item = (String, MemberKind)>,
    {
        let wanted: Vec<(String, MemberKind)> = members.into_iter().collect();
        let current: Vec<Member> = self.members.get(group).cloned().unwrap_or_default();
        for edge in current {
            if !wanted.iter().any(|(dn, kind)| *dn == edge.dn && *kind == edge.kind) {
                self.remove_edge(group, &edge.dn, edge.kind);
            }
        }
        for (member, kind) in wanted {
            self.add(group, &member, kind);
        }
    }

    /// Replaces the subgroup edges of `group`, leaving its user edges alone.
    pub fn replace_subgroups<I>(&mut self, group: &str, subgroups: I)
    where
        I: IntoIterator<Item = String>,
    {
        let users: Vec<(String, MemberKind)> = self
            .members
            .get(group)
            .into_iter()
            .flatten()
            .filter(|m| m.kind == MemberKind::User)
            .map(|m| (m.dn.clone(), MemberKind::User))
            .collect();
        let members: Vec<(String, MemberKind)> = users
            .into_iter()
            .chain(subgroups.into_iter().map(|g| (g, MemberKind::Group)))
            .collect();
        self.replace_members(group, members);
    }

    // == Users Below ==
    /// Every user reachable downwards from `group`, through any depth of
    /// subgroups. Cycles are visited once.
    pub fn users_below(&self, group: &str) -> BTreeSet<String> {
        let mut users = BTreeSet::new();
        let mut visited: HashSet<&str> = HashSet::from([group]);
        let mut frontier = vec![group];

        while let Some(current) = frontier.pop() {
            let Some(members) = self.members.get(current) else {
                continue;
            };
            for member in members {
                match member.kind {
                    MemberKind::Group => {
                        if visited.insert(member.dn.as_str()) {
                            frontier.push(member.dn.as_str());
                        }
                    }
                    MemberKind::User => {
                        users.insert(member.dn.clone());
                    }
                }
            }
        }
        users
    }

    /// All edges, grouped by group in key order.
    pub fn edges(&self) -> Vec<MembershipEdge> {
        self.members
            .iter()
            .flat_map(|(group, members)| {
                members.iter().map(move |member| MembershipEdge {
                    group_dn: group.clone(),
                    member_dn: member.dn.clone(),
                    member_kind: member.kind,
                })
            })
            .collect()
    }

    pub fn group_count(&self) -> usize {
        self.members.len()
    }

    pub fn edge_count(&self) -> usize {
        self.members.values().map(Vec::len).sum()
    }

    // == Generation ==
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
        self.dirty = true;
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    // == Staleness ==
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Flags the index as not trustworthy until rebuilt.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// True when there are changes not yet saved.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // == Persistence ==
    /// Loads a previously saved index. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let index: Self =
            serde_json::from_slice(&bytes).map_err(|e| CacheError::corrupt(INDEX_NAME, e))?;
        debug!(path = %path.display(), generation = index.generation, "membership index loaded");
        Ok(Some(index))
    }

    /// Writes the index next to the caches, replacing the previous file
    /// atomically.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.saved_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| CacheError::Internal(format!("index encode: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;

        self.dirty = false;
        debug!(path = %path.display(), generation = self.generation, "membership index saved");
        Ok(())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> MembershipIndex {
        let mut index = MembershipIndex::new();
        index.add("g1", "u1", MemberKind::User);
        index.add("g1", "g2", MemberKind::Group);
        index.add("g2", "u2", MemberKind::User);
        index.add("g2", "g3", MemberKind::Group);
        index.add("g3", "u3", MemberKind::User);
        index
    }

    #[test]
    fn test_add_keeps_insertion_order() {
        let mut index = sample();
        index.add("g1", "u1", MemberKind::User);
        assert_eq!(index.relevant_for_group("g1"), vec!["u1", "g2"]);
        assert!(index.relevant_for_group("unknown").is_empty());
        assert_eq!(index.edge_count(), 5);
    }

    #[test]
    fn test_users_below_walks_nesting() {
        let index = sample();
        let below: Vec<_> = index.users_below("g1").into_iter().collect();
        assert_eq!(below, vec!["u1", "u2", "u3"]);
        assert_eq!(index.users_below("g3").len(), 1);
    }

    #[test]
    fn test_users_below_terminates_on_cycle() {
        let mut index = sample();
        index.add("g3", "g1", MemberKind::Group);
        assert_eq!(index.users_below("g2").len(), 3);
    }

    #[test]
    fn test_update_user_cache_replaces_groups() {
        let mut index = sample();
        index.update_user_cache("u1", ["g3".to_string()]);
        assert_eq!(index.relevant_for_group("g1"), vec!["g2"]);
        assert!(index.relevant_for_group("g3").contains(&"u1".to_string()));
        assert_eq!(index.groups_of("u1").len(), 1);

        index.update_user_cache("u1", Vec::new());
        assert!(index.groups_of("u1").is_empty());
        assert_eq!(index.kind_of("g3", "u1"), None);
    }

    #[test]
    fn test_replace_subgroups_leaves_users() {
        let mut index = sample();
        index.replace_subgroups("g1", ["g3".to_string()]);
        assert_eq!(index.relevant_for_group("g1"), vec!["u1", "g3"]);
        assert_eq!(index.groups_of("g2"), BTreeSet::new());
    }

    #[test]
    fn test_replace_members_keeps_order() {
        let mut index = sample();
        index.replace_members(
            "g1",
            [
                ("g2".to_string(), MemberKind::Group),
                ("u9".to_string(), MemberKind::User),
            ],
        );
        assert_eq!(index.relevant_for_group("g1"), vec!["g2", "u9"]);
        assert!(index.groups_of("u1").is_empty());

        index.replace_members("g1", Vec::new());
        assert!(index.relevant_for_group("g1").is_empty());
        assert_eq!(index.group_count(), 2);
    }

    #[test]
    fn test_edge_kind_is_per_group() {
        // carol is a user of g2 but listed by x without a flat member entry
        let mut index = MembershipIndex::new();
        index.add("g2", "carol", MemberKind::User);
        index.add("p", "g2", MemberKind::Group);
        index.add("x", "carol", MemberKind::Group);

        assert_eq!(index.kind_of("g2", "carol"), Some(MemberKind::User));
        assert_eq!(index.kind_of("x", "carol"), Some(MemberKind::Group));
        assert_eq!(index.users_below("p"), BTreeSet::from(["carol".to_string()]));
        assert!(index.users_below("x").is_empty());

        // Dropping the user edge leaves the subgroup edge in place
        index.update_user_cache("carol", Vec::new());
        assert_eq!(index.groups_of("carol"), BTreeSet::from(["x".to_string()]));
        assert!(index.users_below("p").is_empty());

        index.replace_subgroups("x", Vec::new());
        assert!(index.groups_of("carol").is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let path = dir.path().join("index.json");

        let mut index = sample();
        index.set_generation(7);
        assert!(index.is_dirty());
        index.save(&path).unwrap();
        assert!(!index.is_dirty());

        let loaded = MembershipIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded.generation(), 7);
        assert_eq!(loaded.edges(), index.edges());
        assert!(loaded.saved_at().is_some());
        assert!(!loaded.is_stale());
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let path = dir.path().join("index.json");
        assert!(MembershipIndex::load(&path).unwrap().is_none());

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            MembershipIndex::load(&path),
            Err(CacheError::CacheCorrupt { .. })
        ));
    }
}
