//! Change Ingester Module
//!
//! Turns one change event into the minimal set of cache writes:
//!
//! 1. every sharded cache whose filters select the old or new entry diffs the
//!    entry's old and new contributions against its stored values
//! 2. derived caches recompute the keys those changes affect, in registry
//!    order, reading through the staged writes
//! 3. all writes plus the next generation commit as one batch
//! 4. the membership index is updated from the committed changes
//!
//! A failed commit leaves caches and index as they were; the event must be
//! replayed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error};

use crate::cache::{
    CacheKind, CacheReader, CacheRegistry, ChangeSet, IngestStats, KeyChange, StagedReader,
};
use crate::directory::{dn, ChangeEvent};
use crate::error::{CacheError, Result};
use crate::storage::WriteBatch;

// == Ingest Report ==
/// What one event changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub dn: String,
    /// Generation after the event; unchanged when nothing was written
    pub generation: u64,
    /// Keys written per cache, deletes included
    pub touched: BTreeMap<String, BTreeSet<String>>,
    /// How many of the touched keys were removed
    pub keys_deleted: usize,
    pub full_recompute: bool,
}

impl IngestReport {
    pub fn keys_written(&self) -> usize {
        self.touched.values().map(BTreeSet::len).sum()
    }

    pub fn is_noop(&self) -> bool {
        self.touched.is_empty()
    }
}

// == Change Ingester ==
pub struct ChangeIngester {
    registry: Arc<CacheRegistry>,
    stats: Arc<Mutex<IngestStats>>,
}

impl ChangeIngester {
    // == Constructor ==
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(Mutex::new(IngestStats::new())),
        }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Shared handle to the counters, for the stats endpoint.
    pub fn stats_handle(&self) -> Arc<Mutex<IngestStats>> {
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    // == Process ==
    /// Applies one change event.
    ///
    /// # Arguments
    /// * `event` - The change; for renames both names are considered
    ///
    /// # Errors
    /// `StorageIo` when the batch could not be committed. Nothing was
    /// applied in that case and the event should be replayed.
    pub fn process(&self, event: &ChangeEvent) -> Result<IngestReport> {
        match self.apply(event) {
            Ok(report) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.record_event(
                        report.keys_written(),
                        report.keys_deleted,
                        report.full_recompute,
                    );
                }
                debug!(
                    dn = %report.dn,
                    keys = report.keys_written(),
                    generation = report.generation,
                    "event applied"
                );
                Ok(report)
            }
            Err(e) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.record_failure();
                }
                error!(dn = %event.dn, operation = ?event.operation, error = %e, "event not applied, replay required");
                Err(e)
            }
        }
    }

    /// Records a completed rebuild in the counters.
    pub fn record_rebuild(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record_rebuild();
        }
    }

    fn apply(&self, event: &ChangeEvent) -> Result<IngestReport> {
        let old = event.old_entry();
        let new = event.new_entry();
        let caches = self.registry.caches()?;

        let mut batch = WriteBatch::new();
        let mut changes = ChangeSet::new();

        // Sharded caches: diff old against new contribution
        for cache in caches.iter().filter(|c| !c.is_derived()) {
            let selects_old = old.as_ref().is_some_and(|e| cache.matches(e));
            let selects_new = new.as_ref().is_some_and(|e| cache.matches(e));
            if !selects_old && !selects_new {
                continue;
            }

            let before = cache.contribution(old.as_ref());
            let after = cache.contribution(new.as_ref());
            let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
            for key in keys {
                let desired = after.get(key).cloned().unwrap_or_default();
                let current = cache.get(key)?;
                if desired != current {
                    batch.put(cache.name(), key, desired.clone());
                    changes.entry(cache.name().to_string()).or_default().push(KeyChange {
                        key: key.clone(),
                        before: current,
                        after: desired,
                    });
                }
            }
        }

        // Derived caches, dependencies first
        let mut full_recompute = false;
        {
            let index = self.registry.index()?;
            for cache in &caches {
                let CacheKind::Derived(rule) = cache.kind() else {
                    continue;
                };
                if !rule.depends_on().iter().any(|d| changes.contains_key(*d)) {
                    continue;
                }

                let propagation = {
                    let reader = StagedReader::new(self.registry.as_ref(), &batch);
                    rule.propagate(&changes, &reader, &index)?
                };
                full_recompute |= propagation.full_recompute;

                for (key, desired) in propagation.updates {
                    let current =
                        StagedReader::new(self.registry.as_ref(), &batch).get(cache.name(), &key)?;
                    if desired != current {
                        batch.put(cache.name(), &key, desired.clone());
                        changes.entry(cache.name().to_string()).or_default().push(KeyChange {
                            key,
                            before: current,
                            after: desired,
                        });
                    }
                }
            }
        }

        let dn = dn::normalize(&event.dn);
        if batch.is_empty() {
            return Ok(IngestReport {
                dn,
                generation: self.registry.generation(),
                touched: BTreeMap::new(),
                keys_deleted: 0,
                full_recompute,
            });
        }

        let touched: BTreeMap<String, BTreeSet<String>> = changes
            .iter()
            .map(|(cache, list)| (cache.clone(), list.iter().map(|c| c.key.clone()).collect()))
            .collect();
        let keys_deleted = changes
            .values()
            .flatten()
            .filter(|c| c.after.is_empty())
            .count();

        let generation = self.registry.stage_generation(&mut batch);
        self.registry
            .backend()
            .commit(&batch)
            .map_err(|e| match e {
                CacheError::StorageIo(_) => e,
                other => CacheError::StorageIo(other.to_string()),
            })?;
        self.registry.set_generation(generation);
        self.registry.update_index(&changes, generation, full_recompute)?;

        Ok(IngestReport {
            dn,
            generation,
            touched,
            keys_deleted,
            full_recompute,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DIRECT_MEMBERS, NESTED_GROUPS, NESTED_USER_GROUPS, UIDS, USER_GROUPS};
    use crate::config::Config;
    use crate::directory::{Entry, MemoryDirectory};
    use crate::storage::{BackendKind, Values};
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn set(items: &[&str]) -> Values {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn create_test_ingester() -> (ChangeIngester, TempDir) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let mut config = Config::with_data_dir(BackendKind::Lmdb, dir.path());
        config.lmdb_map_size_mb = 16;
        let registry = Arc::new(CacheRegistry::init(&config).unwrap());
        (ChangeIngester::new(registry), dir)
    }

    fn group(name: &str, users: &[&str], subgroups: &[&str]) -> Entry {
        let members = users
            .iter()
            .map(|u| format!("uid={},dc=example", u))
            .chain(subgroups.iter().map(|g| format!("cn={},dc=example", g)));
        Entry::new(format!("cn={},dc=example", name))
            .with("objectClass", ["posixGroup"])
            .with("uniqueMember", members)
            .with("memberUid", users)
    }

    fn get(ingester: &ChangeIngester, cache: &str, key: &str) -> Values {
        ingester.registry().get(cache, key).unwrap()
    }

    #[test]
    fn test_add_group_updates_all_membership_caches() {
        let (ingester, _dir) = create_test_ingester();
        let report = ingester
            .process(&ChangeEvent::add(group("staff", &["alice", "bob"], &[])))
            .unwrap();

        assert_eq!(report.generation, 1);
        assert_eq!(report.touched[DIRECT_MEMBERS].len(), 1);
        assert_eq!(report.touched[USER_GROUPS].len(), 2);
        assert!(!report.touched.contains_key(NESTED_GROUPS));
        assert_eq!(
            get(&ingester, NESTED_USER_GROUPS, "uid=bob,dc=example"),
            set(&["cn=staff,dc=example"])
        );
    }

    #[test]
    fn test_modify_touches_only_changed_keys() {
        let (ingester, _dir) = create_test_ingester();
        ingester
            .process(&ChangeEvent::add(group("staff", &["alice", "bob"], &[])))
            .unwrap();

        let report = ingester
            .process(&ChangeEvent::modify(
                group("staff", &["alice", "bob"], &[]),
                group("staff", &["alice", "carol"], &[]),
            ))
            .unwrap();

        let users: Vec<_> = report.touched[USER_GROUPS].iter().cloned().collect();
        assert_eq!(users, vec!["uid=bob,dc=example", "uid=carol,dc=example"]);
        assert_eq!(report.keys_deleted, 2);
        assert!(get(&ingester, USER_GROUPS, "uid=bob,dc=example").is_empty());
    }

    #[test]
    fn test_nesting_change_reaches_users_below() {
        let (ingester, _dir) = create_test_ingester();
        ingester
            .process(&ChangeEvent::add(group("admins", &["bob"], &[])))
            .unwrap();
        ingester
            .process(&ChangeEvent::add(group("staff", &["alice"], &[])))
            .unwrap();

        let report = ingester
            .process(&ChangeEvent::modify(
                group("staff", &["alice"], &[]),
                group("staff", &["alice"], &["admins"]),
            ))
            .unwrap();
        assert!(!report.full_recompute);
        assert_eq!(
            report.touched[NESTED_USER_GROUPS],
            BTreeSet::from(["uid=bob,dc=example".to_string()])
        );
        assert_eq!(
            get(&ingester, NESTED_USER_GROUPS, "uid=bob,dc=example"),
            set(&["cn=admins,dc=example", "cn=staff,dc=example"])
        );

        // And back out again
        ingester
            .process(&ChangeEvent::modify(
                group("staff", &["alice"], &["admins"]),
                group("staff", &["alice"], &[]),
            ))
            .unwrap();
        assert_eq!(
            get(&ingester, NESTED_USER_GROUPS, "uid=bob,dc=example"),
            set(&["cn=admins,dc=example"])
        );
    }

    #[test]
    fn test_user_listed_as_subgroup_elsewhere_loses_nested_group() {
        let (ingester, _dir) = create_test_ingester();
        let registry = Arc::clone(ingester.registry());
        let with_nesting = group("p", &[], &["g2"]);
        // x references carol without a memberUid, so she reads as a subgroup there
        let x = Entry::new("cn=x,dc=example")
            .with("objectClass", ["posixGroup"])
            .with("uniqueMember", ["uid=carol,dc=example"]);
        let source: MemoryDirectory = [group("g2", &["carol"], &[]), with_nesting.clone(), x]
            .into_iter()
            .collect();
        registry
            .rebuild_all(&source, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(
            get(&ingester, NESTED_USER_GROUPS, "uid=carol,dc=example"),
            set(&["cn=g2,dc=example", "cn=p,dc=example"])
        );

        let report = ingester
            .process(&ChangeEvent::modify(with_nesting, group("p", &[], &[])))
            .unwrap();
        assert!(!report.full_recompute);
        assert_eq!(
            get(&ingester, NESTED_USER_GROUPS, "uid=carol,dc=example"),
            set(&["cn=g2,dc=example"])
        );
        assert_eq!(
            crate::query::groups_for_user(registry.as_ref(), "uid=carol,dc=example", true).unwrap(),
            set(&["cn=g2,dc=example"])
        );
    }

    #[test]
    fn test_stale_index_falls_back_to_full_recompute() {
        let (ingester, _dir) = create_test_ingester();
        ingester
            .process(&ChangeEvent::add(group("admins", &["bob"], &[])))
            .unwrap();
        ingester.registry().index_mut().unwrap().mark_stale();

        let report = ingester
            .process(&ChangeEvent::add(group("staff", &["alice"], &["admins"])))
            .unwrap();
        assert!(report.full_recompute);
        assert_eq!(
            get(&ingester, NESTED_USER_GROUPS, "uid=bob,dc=example"),
            set(&["cn=admins,dc=example", "cn=staff,dc=example"])
        );
        assert!(!ingester.registry().index().unwrap().is_stale());
        assert_eq!(ingester.stats().full_recomputes, 1);
    }

    #[test]
    fn test_delete_and_rename() {
        let (ingester, _dir) = create_test_ingester();
        let staff = group("staff", &["alice"], &[]);
        ingester.process(&ChangeEvent::add(staff.clone())).unwrap();

        let renamed = group("team", &["alice"], &[]);
        ingester
            .process(&ChangeEvent::rename(staff, renamed.clone()))
            .unwrap();
        assert!(get(&ingester, DIRECT_MEMBERS, "cn=staff,dc=example").is_empty());
        assert_eq!(
            get(&ingester, USER_GROUPS, "uid=alice,dc=example"),
            set(&["cn=team,dc=example"])
        );

        ingester.process(&ChangeEvent::delete(renamed)).unwrap();
        assert!(get(&ingester, USER_GROUPS, "uid=alice,dc=example").is_empty());
        assert!(get(&ingester, NESTED_USER_GROUPS, "uid=alice,dc=example").is_empty());
    }

    #[test]
    fn test_irrelevant_change_is_noop() {
        let (ingester, _dir) = create_test_ingester();
        let printer = Entry::new("cn=printer,dc=example").with("objectClass", ["device"]);
        let report = ingester.process(&ChangeEvent::add(printer)).unwrap();
        assert!(report.is_noop());
        assert_eq!(report.generation, 0);

        // memberUid without a matching uniqueMember adds nothing
        let flat = Entry::new("cn=flat,dc=example")
            .with("objectClass", ["posixGroup"])
            .with("memberUid", ["alice"]);
        assert!(ingester.process(&ChangeEvent::add(flat)).unwrap().is_noop());
        assert_eq!(ingester.stats().events_processed, 2);
    }

    #[test]
    fn test_oversized_member_dn_does_not_fail_event() {
        let (ingester, _dir) = create_test_ingester();
        let long_id = "a".repeat(crate::storage::MAX_KEY_LEN);
        let report = ingester
            .process(&ChangeEvent::add(group("staff", &["alice", long_id.as_str()], &[])))
            .unwrap();

        assert_eq!(report.touched[USER_GROUPS].len(), 1);
        assert_eq!(
            get(&ingester, DIRECT_MEMBERS, "cn=staff,dc=example"),
            set(&["uid=alice,dc=example"])
        );
    }

    #[test]
    fn test_uid_shard_follows_accounts() {
        let (ingester, _dir) = create_test_ingester();
        let user = Entry::new("uid=Alice,dc=example")
            .with("objectClass", ["posixAccount"])
            .with("uid", ["Alice"]);
        ingester.process(&ChangeEvent::add(user.clone())).unwrap();
        assert_eq!(get(&ingester, UIDS, "uid=alice,dc=example"), set(&["Alice"]));

        ingester.process(&ChangeEvent::delete(user)).unwrap();
        assert!(get(&ingester, UIDS, "uid=alice,dc=example").is_empty());
    }
}
