//! Derived caches and their change propagation.
//!
//! A derived cache is a pure function of other caches. `build` computes it
//! from scratch; `propagate` recomputes only the keys a set of base changes
//! can affect.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::cache::{CacheReader, DIRECT_MEMBERS, NESTED_GROUPS, NESTED_USER_GROUPS, USER_GROUPS};
use crate::error::Result;
use crate::index::MembershipIndex;
use crate::query::closure::{self, NestedParents};
use crate::storage::Values;

// == Key Change ==
/// One key whose stored value set changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: String,
    pub before: Values,
    pub after: Values,
}

impl KeyChange {
    pub fn added(&self) -> impl Iterator<Item = &String> {
        self.after.difference(&self.before)
    }

    pub fn removed(&self) -> impl Iterator<Item = &String> {
        self.before.difference(&self.after)
    }
}

/// Changes staged during one event, by cache name.
pub type ChangeSet = BTreeMap<String, Vec<KeyChange>>;

// == Propagation ==
/// New values for the affected keys of a derived cache. An empty set means
/// the key is to be removed.
#[derive(Debug, Default)]
pub struct Propagation {
    pub updates: BTreeMap<String, Values>,
    /// True when the membership index could not narrow the affected keys
    pub full_recompute: bool,
}

// == Derived Rule ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedRule {
    /// Inversion of direct-members: user → groups listing the user
    UserGroups,
    /// Closure of user-groups over nested-groups
    NestedUserGroups,
}

impl DerivedRule {
    /// Registration order; every rule comes after the rules it reads from.
    pub const ALL: [DerivedRule; 2] = [DerivedRule::UserGroups, DerivedRule::NestedUserGroups];

    pub fn cache_name(self) -> &'static str {
        match self {
            DerivedRule::UserGroups => USER_GROUPS,
            DerivedRule::NestedUserGroups => NESTED_USER_GROUPS,
        }
    }

    pub fn depends_on(self) -> &'static [&'static str] {
        match self {
            DerivedRule::UserGroups => &[DIRECT_MEMBERS],
            DerivedRule::NestedUserGroups => &[USER_GROUPS, NESTED_GROUPS],
        }
    }

    // == Build ==
    /// Computes the full content from the dependencies in `reader`.
    pub fn build(self, reader: &dyn CacheReader) -> Result<BTreeMap<String, Values>> {
        match self {
            DerivedRule::UserGroups => {
                let mut inverted: BTreeMap<String, Values> = BTreeMap::new();
                for (group, users) in reader.scan(DIRECT_MEMBERS)? {
                    for user in users {
                        inverted.entry(user).or_default().insert(group.clone());
                    }
                }
                Ok(inverted)
            }
            DerivedRule::NestedUserGroups => {
                let parents = NestedParents::load(reader)?;
                Ok(reader
                    .scan(USER_GROUPS)?
                    .into_iter()
                    .map(|(user, direct)| (user, parents.expand(direct)))
                    .collect())
            }
        }
    }

    // == Propagate ==
    /// Recomputes the keys affected by `changes`.
    ///
    /// # Arguments
    /// * `changes` - Base-cache changes staged so far for this event
    /// * `reader` - View including those staged changes
    /// * `index` - Membership index as of the previous event
    pub fn propagate(
        self,
        changes: &ChangeSet,
        reader: &dyn CacheReader,
        index: &MembershipIndex,
    ) -> Result<Propagation> {
        match self {
            DerivedRule::UserGroups => propagate_user_groups(changes, reader),
            DerivedRule::NestedUserGroups => propagate_nested_user_groups(changes, reader, index),
        }
    }
}

/// Applies per-group member deltas to the inverted mapping.
fn propagate_user_groups(changes: &ChangeSet, reader: &dyn CacheReader) -> Result<Propagation> {
    let mut updates: BTreeMap<String, Values> = BTreeMap::new();
    let Some(group_changes) = changes.get(DIRECT_MEMBERS) else {
        return Ok(Propagation::default());
    };

    for change in group_changes {
        for user in change.removed() {
            groups_of(&mut updates, reader, user)?.remove(&change.key);
        }
        for user in change.added() {
            groups_of(&mut updates, reader, user)?.insert(change.key.clone());
        }
    }

    Ok(Propagation {
        updates,
        full_recompute: false,
    })
}

/// Working copy of a user's groups, read through on first touch.
fn groups_of<'m>(
    updates: &'m mut BTreeMap<String, Values>,
    reader: &dyn CacheReader,
    user: &str,
) -> Result<&'m mut Values> {
    match updates.entry(user.to_string()) {
        Entry::Occupied(slot) => Ok(slot.into_mut()),
        Entry::Vacant(slot) => Ok(slot.insert(reader.get(USER_GROUPS, user)?)),
    }
}

/// Re-closes the users whose direct groups changed or who sit below a group
/// whose nesting changed.
fn propagate_nested_user_groups(
    changes: &ChangeSet,
    reader: &dyn CacheReader,
    index: &MembershipIndex,
) -> Result<Propagation> {
    let mut affected: BTreeSet<String> = BTreeSet::new();
    let mut full_recompute = false;

    if let Some(user_changes) = changes.get(USER_GROUPS) {
        affected.extend(user_changes.iter().map(|c| c.key.clone()));
    }

    if let Some(group_changes) = changes.get(NESTED_GROUPS) {
        if index.is_stale() {
            full_recompute = true;
        } else {
            for change in group_changes {
                // Below the group before the change, and after it
                affected.extend(index.users_below(&change.key));
                affected.extend(closure::users_in_group(reader, &change.key, true)?);
            }
        }
    }

    if full_recompute {
        debug!("membership index stale, recomputing every user");
        affected.extend(reader.keys(USER_GROUPS)?);
        affected.extend(reader.keys(NESTED_USER_GROUPS)?);
    }

    let parents = NestedParents::load(reader)?;
    let mut updates = BTreeMap::new();
    for user in affected {
        let direct = reader.get(USER_GROUPS, &user)?;
        updates.insert(user, parents.expand(direct));
    }

    Ok(Propagation {
        updates,
        full_recompute,
    })
}
