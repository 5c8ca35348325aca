//! Cache Store Module
//!
//! A named cache: either fed by shards from directory entries, or derived from
//! other caches. Content lives in a backend store; this type adds the cache
//! semantics on top (contributions, full load/save, dependency declaration).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheEntry, DerivedRule};
use crate::directory::Entry;
use crate::error::{CacheError, Result};
use crate::shard::ShardDefinition;
use crate::storage::{self, Backend, Store, Values};

// == Cache Kind ==
#[derive(Debug, Clone)]
pub enum CacheKind {
    /// Populated by applying shards to directory entries
    Sharded(Vec<ShardDefinition>),
    /// Computed from other caches
    Derived(DerivedRule),
}

// == Cache ==
pub struct Cache {
    name: String,
    kind: CacheKind,
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
}

impl Cache {
    // == Constructors ==
    /// Opens a shard-fed cache.
    ///
    /// # Arguments
    /// * `name` - Cache name, also the storage name
    /// * `shards` - Contributing shards; may be empty until one is added
    /// * `backend` - Storage backend the cache lives in
    pub fn sharded(
        name: &str,
        shards: Vec<ShardDefinition>,
        backend: Arc<dyn Backend>,
    ) -> Result<Self> {
        storage::validate_cache_name(name)?;
        Ok(Self {
            name: name.to_string(),
            kind: CacheKind::Sharded(shards),
            store: backend.open(name)?,
            backend,
        })
    }

    /// Opens the cache computed by `rule`.
    pub fn derived(rule: DerivedRule, backend: Arc<dyn Backend>) -> Result<Self> {
        let name = rule.cache_name();
        Ok(Self {
            name: name.to_string(),
            kind: CacheKind::Derived(rule),
            store: backend.open(name)?,
            backend,
        })
    }

    /// Copy of this cache with one more shard.
    pub fn with_shard(&self, shard: ShardDefinition) -> Result<Self> {
        let CacheKind::Sharded(shards) = &self.kind else {
            return Err(CacheError::Configuration(format!(
                "cache '{}' is derived and takes no shards",
                self.name
            )));
        };
        let mut shards = shards.clone();
        shards.push(shard);
        Ok(Self {
            name: self.name.clone(),
            kind: CacheKind::Sharded(shards),
            store: Arc::clone(&self.store),
            backend: Arc::clone(&self.backend),
        })
    }

    // == Accessors ==
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &CacheKind {
        &self.kind
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, CacheKind::Derived(_))
    }

    /// Contributing shards; empty for derived caches.
    pub fn shards(&self) -> &[ShardDefinition] {
        match &self.kind {
            CacheKind::Sharded(shards) => shards,
            CacheKind::Derived(_) => &[],
        }
    }

    pub fn has_shard(&self, shard: &str) -> bool {
        self.shards().iter().any(|s| s.name == shard)
    }

    /// Caches this one is computed from.
    pub fn depends_on(&self) -> &'static [&'static str] {
        match &self.kind {
            CacheKind::Sharded(_) => &[],
            CacheKind::Derived(rule) => rule.depends_on(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // == Shard Application ==
    /// True when any shard's filter selects `entry`.
    pub fn matches(&self, entry: &Entry) -> bool {
        self.shards().iter().any(|s| s.filter.matches(entry))
    }

    /// Everything `entry` contributes to this cache, merged across shards.
    /// `None` (entry absent) contributes nothing.
    pub fn contribution(&self, entry: Option<&Entry>) -> BTreeMap<String, Values> {
        let mut out: BTreeMap<String, Values> = BTreeMap::new();
        let Some(entry) = entry else {
            return out;
        };
        for shard in self.shards() {
            if let Some((key, values)) = shard.apply(entry) {
                out.entry(key).or_default().extend(values);
            }
        }
        out
    }

    // == Reads ==
    /// Values under `key`, empty when absent.
    pub fn get(&self, key: &str) -> Result<Values> {
        self.store.get(key)
    }

    /// Lazily iterates over stored entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = Result<CacheEntry>> + '_ {
        self.store.iterate().map(|item| item.map(CacheEntry::from))
    }

    // == Load ==
    /// Full key → values mapping. Unreadable content is `CacheCorrupt`.
    pub fn load(&self) -> Result<BTreeMap<String, Values>> {
        let mut map = BTreeMap::new();
        for item in self.entries() {
            let entry = item?;
            map.insert(entry.key, entry.values);
        }
        Ok(map)
    }

    // == Save ==
    /// Replaces the whole content with `mapping` in one atomic step.
    pub fn save(&self, mapping: &BTreeMap<String, Values>) -> Result<()> {
        let scratch = self.backend.open_scratch(&self.name)?;
        for (key, values) in mapping.iter().filter(|(_, v)| !v.is_empty()) {
            if let Err(e) = scratch.put(key, values) {
                self.backend.discard_scratch(&self.name)?;
                return Err(e);
            }
        }
        self.backend.promote_scratch(&self.name)?;
        debug!(cache = %self.name, keys = mapping.len(), "cache saved");
        Ok(())
    }

    // == Clear ==
    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }

    // == Length ==
    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        for item in self.store.iterate() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        match self.store.iterate().next() {
            Some(item) => item.map(|_| false),
            None => Ok(true),
        }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard;
    use crate::storage::LmdbBackend;
    use tempfile::TempDir;

    fn set(items: &[&str]) -> Values {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn create_test_backend() -> (Arc<dyn Backend>, TempDir) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let backend = LmdbBackend::open(dir.path(), 16).expect("backend should open");
        (Arc::new(backend), dir)
    }

    fn uid_cache(backend: Arc<dyn Backend>) -> Cache {
        let shards = vec![
            shard::lookup("user-uid").unwrap().definition(),
            shard::lookup("computer-uid").unwrap().definition(),
        ];
        Cache::sharded("uids", shards, backend).unwrap()
    }

    #[test]
    fn test_contribution_merges_shards() {
        let (backend, _dir) = create_test_backend();
        let cache = uid_cache(backend);

        let user = Entry::new("uid=alice,dc=example")
            .with("objectClass", ["posixAccount"])
            .with("uid", ["alice"]);
        let host = Entry::new("cn=ws01,dc=example")
            .with("objectClass", ["posixAccount", "univentionHost"])
            .with("uid", ["ws01$"]);

        assert_eq!(
            cache.contribution(Some(&user)),
            BTreeMap::from([("uid=alice,dc=example".to_string(), set(&["alice"]))])
        );
        assert_eq!(
            cache.contribution(Some(&host)),
            BTreeMap::from([("cn=ws01,dc=example".to_string(), set(&["ws01$"]))])
        );
        assert!(cache.contribution(None).is_empty());
        assert!(cache.matches(&host));
    }

    #[test]
    fn test_save_replaces_content() {
        let (backend, _dir) = create_test_backend();
        let cache = uid_cache(backend);
        cache.store().put("stale", &set(&["x"])).unwrap();

        let mapping = BTreeMap::from([
            ("a".to_string(), set(&["1"])),
            ("b".to_string(), set(&["2", "3"])),
            ("empty".to_string(), Values::new()),
        ]);
        cache.save(&mapping).unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["b"], set(&["2", "3"]));
        assert!(cache.get("stale").unwrap().is_empty());
        assert_eq!(cache.len().unwrap(), 2);
    }

    #[test]
    fn test_with_shard_on_derived_is_rejected() {
        let (backend, _dir) = create_test_backend();
        let cache = Cache::derived(DerivedRule::UserGroups, backend).unwrap();
        let shard = shard::lookup("user-uid").unwrap().definition();
        assert!(matches!(
            cache.with_shard(shard),
            Err(CacheError::Configuration(_))
        ));
        assert!(cache.depends_on().contains(&crate::cache::DIRECT_MEMBERS));
    }

    #[test]
    fn test_clear_and_is_empty() {
        let (backend, _dir) = create_test_backend();
        let cache = uid_cache(backend);
        assert!(cache.is_empty().unwrap());
        cache.store().put("k", &set(&["v"])).unwrap();
        assert!(!cache.is_empty().unwrap());
        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
    }
}
