//! Shard class catalog.
//!
//! Closed registry mapping shard-class identifiers from configuration to their
//! definitions. Anything not listed here is a configuration error; nothing is
//! loaded dynamically.

use super::{Cardinality, ShardDefinition, Transform};
use crate::cache::{DIRECT_MEMBERS, NESTED_GROUPS, UIDS};
use crate::directory::{dn, Entry, Filter};
use crate::error::{CacheError, Result};

/// Bumped whenever a shard's extraction semantics change.
pub const CATALOG_VERSION: u32 = 1;

const MEMBER_REF_ATTR: &str = "uniqueMember";
const MEMBER_UID_ATTR: &str = "memberUid";

// == Shard Class ==
#[derive(Debug)]
pub struct ShardClass {
    pub id: &'static str,
    /// Cache the shard contributes to
    pub cache: &'static str,
    build: fn() -> ShardDefinition,
}

impl ShardClass {
    pub fn definition(&self) -> ShardDefinition {
        (self.build)()
    }
}

static SHARD_CLASSES: &[ShardClass] = &[
    ShardClass {
        id: "direct-members",
        cache: DIRECT_MEMBERS,
        build: direct_members,
    },
    ShardClass {
        id: "nested-groups",
        cache: NESTED_GROUPS,
        build: nested_groups,
    },
    ShardClass {
        id: "user-uid",
        cache: UIDS,
        build: user_uid,
    },
    ShardClass {
        id: "computer-uid",
        cache: UIDS,
        build: computer_uid,
    },
];

/// Resolves a shard-class identifier.
pub fn lookup(id: &str) -> Result<&'static ShardClass> {
    SHARD_CLASSES.iter().find(|c| c.id == id).ok_or_else(|| {
        CacheError::Configuration(format!(
            "unknown shard class '{}' (catalog v{})",
            id, CATALOG_VERSION
        ))
    })
}

/// Every shard class known to this build.
pub fn all() -> &'static [ShardClass] {
    SHARD_CLASSES
}

// == Group Shards ==
fn group_filter() -> Filter {
    Filter::object_class("posixGroup")
}

fn group_key(entry: &Entry) -> Option<String> {
    dn::short_id(&entry.dn)?;
    Some(dn::normalize(&entry.dn))
}

/// Lowercased flat member list of a group.
fn member_uids(entry: &Entry) -> Vec<String> {
    entry
        .strings(MEMBER_UID_ATTR)
        .into_iter()
        .map(|uid| uid.to_lowercase())
        .collect()
}

/// Member references admitted only when their short id also appears in the
/// flat member list.
fn direct_member_values(entry: &Entry) -> Option<Vec<String>> {
    let uids = member_uids(entry);
    Some(
        entry
            .strings(MEMBER_REF_ATTR)
            .into_iter()
            .filter(|member| match dn::short_id(member) {
                Some(id) => uids.contains(&id.to_lowercase()),
                None => false,
            })
            .map(|member| dn::normalize(&member))
            .collect(),
    )
}

/// Member references that are neither users nor computer accounts.
fn nested_group_values(entry: &Entry) -> Option<Vec<String>> {
    let uids = member_uids(entry);
    Some(
        entry
            .strings(MEMBER_REF_ATTR)
            .into_iter()
            .filter(|member| match dn::short_id(member) {
                Some(id) => {
                    let id = id.to_lowercase();
                    let is_user = uids.contains(&id);
                    let is_computer = uids.contains(&format!("{}$", id));
                    !is_user && !is_computer
                }
                None => false,
            })
            .map(|member| dn::normalize(&member))
            .collect(),
    )
}

fn direct_members() -> ShardDefinition {
    ShardDefinition {
        name: "direct-members",
        filter: group_filter(),
        key: group_key,
        values: direct_member_values,
        cardinality: Cardinality::Multi,
        transform: Transform::Lowercase,
    }
}

fn nested_groups() -> ShardDefinition {
    ShardDefinition {
        name: "nested-groups",
        filter: group_filter(),
        key: group_key,
        values: nested_group_values,
        cardinality: Cardinality::Multi,
        transform: Transform::Lowercase,
    }
}

// == Account Shards ==
fn account_key(entry: &Entry) -> Option<String> {
    Some(dn::normalize(&entry.dn))
}

fn user_uid() -> ShardDefinition {
    ShardDefinition {
        name: "user-uid",
        filter: Filter::And(vec![
            Filter::object_class("posixAccount"),
            Filter::present("uid"),
        ]),
        key: account_key,
        values: |entry| {
            Some(
                entry
                    .strings("uid")
                    .into_iter()
                    .filter(|uid| !dn::is_computer_id(uid))
                    .collect(),
            )
        },
        cardinality: Cardinality::Single,
        transform: Transform::Identity,
    }
}

fn computer_uid() -> ShardDefinition {
    ShardDefinition {
        name: "computer-uid",
        filter: Filter::And(vec![
            Filter::object_class("univentionHost"),
            Filter::present("uid"),
        ]),
        key: account_key,
        values: |entry| Some(entry.strings("uid")),
        cardinality: Cardinality::Single,
        transform: Transform::Identity,
    }
}
