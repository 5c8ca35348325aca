//! Cache Registry Module
//!
//! Owns the backend, the configured caches in dependency order, the
//! membership index and the ingest generation. Every mutation of cache
//! content goes through one writer (see `tasks::writer`); readers only take
//! short read locks to clone cache handles.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{
    Cache, CacheKind, CacheReader, ChangeSet, DerivedRule, DIRECT_MEMBERS, NESTED_GROUPS,
    USER_GROUPS,
};
use crate::config::Config;
use crate::directory::{dn, DirectorySource};
use crate::error::{CacheError, Result};
use crate::index::MembershipIndex;
use crate::shard::{self, CATALOG_VERSION};
use crate::storage::{self, Backend, BackendKind, Store, Values, WriteBatch, META_STORE};

const GENERATION_KEY: &str = "generation";

fn built_key(cache: &str) -> String {
    format!("built:{}", cache)
}

fn single(value: impl ToString) -> Values {
    Values::from([value.to_string()])
}

// == Subscriptions ==
/// What the change feed must deliver for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub cache: String,
    pub shard: String,
    pub filter: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSubscriptions {
    pub subscriptions: Vec<Subscription>,
    /// Disjunction of every distinct shard filter
    pub filter: String,
}

// == Rebuild Report ==
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildReport {
    /// Caches rebuilt, in the order they were promoted
    pub caches: Vec<String>,
    pub entries_scanned: usize,
    pub keys_written: usize,
    pub generation: u64,
}

// == Cache Registry ==
pub struct CacheRegistry {
    backend: Arc<dyn Backend>,
    meta: Arc<dyn Store>,
    /// Sharded caches first, then derived caches after their dependencies
    caches: RwLock<Vec<Arc<Cache>>>,
    index: RwLock<MembershipIndex>,
    index_path: PathBuf,
    generation: AtomicU64,
}

impl CacheRegistry {
    // == Init ==
    /// Opens the backend and every configured cache, then loads or rebuilds
    /// the membership index.
    ///
    /// Fails with a configuration error on an unknown shard class or when
    /// another backend kind is already active in this process.
    pub fn init(config: &Config) -> Result<Self> {
        config.validate()?;
        let backend = storage::open_backend(config)?;
        let meta = backend.open(META_STORE)?;

        let mut caches: Vec<Arc<Cache>> = Vec::new();
        for id in &config.shard_classes {
            let class = shard::lookup(id)?;
            match caches.iter().position(|c| c.name() == class.cache) {
                Some(pos) if caches[pos].has_shard(class.id) => {}
                Some(pos) => {
                    caches[pos] = Arc::new(caches[pos].with_shard(class.definition())?);
                }
                None => caches.push(Arc::new(Cache::sharded(
                    class.cache,
                    vec![class.definition()],
                    Arc::clone(&backend),
                )?)),
            }
        }
        register_derived(&mut caches, &backend)?;

        let generation = read_generation(meta.as_ref())?;
        let registry = Self {
            backend,
            meta,
            caches: RwLock::new(caches),
            index: RwLock::new(MembershipIndex::new()),
            index_path: config.index_path(),
            generation: AtomicU64::new(generation),
        };
        registry.load_index();

        info!(
            backend = %registry.backend.kind(),
            caches = ?registry.cache_names(),
            generation,
            "cache registry initialized"
        );
        Ok(registry)
    }

    /// Loads the persisted index if it matches the stored generation,
    /// otherwise rebuilds it from the caches.
    fn load_index(&self) {
        let generation = self.generation();
        match MembershipIndex::load(&self.index_path) {
            Ok(Some(index)) if index.generation() == generation => {
                if let Ok(mut slot) = self.index.write() {
                    *slot = index;
                }
                return;
            }
            Ok(Some(index)) => warn!(
                stored = index.generation(),
                expected = generation,
                "membership index out of date, rebuilding"
            ),
            Ok(None) => debug!("no persisted membership index"),
            Err(e) => warn!(error = %e, "membership index unreadable, rebuilding"),
        }
        self.refresh_index();
    }

    /// Rebuilds the index from committed cache content. On failure the
    /// index is left marked stale.
    pub fn refresh_index(&self) {
        let rebuilt = MembershipIndex::from_reader(self);
        let Ok(mut slot) = self.index.write() else {
            return;
        };
        match rebuilt {
            Ok(mut index) => {
                index.set_generation(self.generation());
                *slot = index;
            }
            Err(e) => {
                warn!(error = %e, "membership index rebuild failed, marking stale");
                slot.mark_stale();
            }
        }
    }

    // == Shutdown ==
    /// Persists the index and flushes the backend.
    pub fn shutdown(&self) -> Result<()> {
        self.persist_index()?;
        self.backend.flush()?;
        info!("cache registry shut down");
        Ok(())
    }

    /// Saves the index when it has unsaved changes.
    pub fn persist_index(&self) -> Result<bool> {
        let mut index = self.index_mut()?;
        if !index.is_dirty() || index.is_stale() {
            return Ok(false);
        }
        index.save(&self.index_path)?;
        Ok(true)
    }

    // == Reset ==
    /// Drops all cache content, markers and the persisted index.
    pub fn reset(&self) -> Result<()> {
        for cache in self.caches()? {
            self.backend.remove(cache.name())?;
        }
        self.meta.clear()?;
        self.generation.store(0, Ordering::SeqCst);
        *self.index_mut()? = MembershipIndex::new();
        if self.index_path.exists() {
            fs::remove_file(&self.index_path)?;
        }
        info!("cache registry reset");
        Ok(())
    }

    // == Lookup ==
    pub fn cache(&self, name: &str) -> Result<Arc<Cache>> {
        self.caches_read()?
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| CacheError::Configuration(format!("unknown cache '{}'", name)))
    }

    /// Snapshot of the registered caches in dependency order.
    pub fn caches(&self) -> Result<Vec<Arc<Cache>>> {
        Ok(self.caches_read()?.clone())
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches_read()
            .map(|caches| caches.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    // == Build State ==
    /// True when `name` was fully built with the current shard catalog.
    pub fn is_built(&self, name: &str) -> Result<bool> {
        let marker = self.meta.get(&built_key(name))?;
        Ok(marker.contains(&CATALOG_VERSION.to_string()))
    }

    /// Fails with `StaleCache` unless every named cache is registered and
    /// built.
    pub fn ensure_built(&self, names: &[&str]) -> Result<()> {
        for name in names {
            self.cache(name)?;
            if !self.is_built(name)? {
                return Err(CacheError::StaleCache(format!(
                    "cache '{}' has not been built",
                    name
                )));
            }
        }
        Ok(())
    }

    // == Generation ==
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stages the next generation into `batch` and returns it. The counter
    /// itself advances only once the batch is committed.
    pub fn stage_generation(&self, batch: &mut WriteBatch) -> u64 {
        let next = self.generation() + 1;
        batch.put(META_STORE, GENERATION_KEY, single(next));
        next
    }

    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    // == Index Access ==
    pub fn index(&self) -> Result<RwLockReadGuard<'_, MembershipIndex>> {
        self.index
            .read()
            .map_err(|_| CacheError::Internal("membership index lock poisoned".into()))
    }

    pub fn index_mut(&self) -> Result<RwLockWriteGuard<'_, MembershipIndex>> {
        self.index
            .write()
            .map_err(|_| CacheError::Internal("membership index lock poisoned".into()))
    }

    /// Applies committed changes to the index. Falls back to a rebuild from
    /// the caches when the index is stale or propagation bypassed it.
    pub fn update_index(&self, changes: &ChangeSet, generation: u64, full: bool) -> Result<()> {
        if full || self.index()?.is_stale() {
            self.refresh_index();
            return Ok(());
        }

        let mut index = self.index_mut()?;
        for change in changes.get(USER_GROUPS).into_iter().flatten() {
            index.update_user_cache(&change.key, change.after.iter().cloned());
        }
        for change in changes.get(NESTED_GROUPS).into_iter().flatten() {
            index.replace_subgroups(&change.key, change.after.iter().cloned());
        }
        index.set_generation(generation);
        Ok(())
    }

    // == Rebuild ==
    /// Recomputes `name` from `source`, then every cache depending on it.
    ///
    /// Each cache is written into its scratch area and promoted atomically,
    /// so readers see either the old or the new content. When `cancel` is
    /// raised the current scratch area is discarded and the call fails with
    /// `RebuildInterrupted`; caches promoted before that point keep their
    /// new content but are not marked built.
    pub fn rebuild(
        &self,
        name: &str,
        source: &dyn DirectorySource,
        cancel: &AtomicBool,
    ) -> Result<RebuildReport> {
        let root = self.cache(name)?;
        let mut order = vec![root];
        order.extend(self.dependents_of(name)?);

        let mut report = RebuildReport::default();
        for cache in &order {
            self.rebuild_one(cache, source, cancel, &mut report)?;
            report.caches.push(cache.name().to_string());
        }

        let mut batch = WriteBatch::new();
        for cache in &order {
            batch.put(META_STORE, &built_key(cache.name()), single(CATALOG_VERSION));
        }
        let generation = self.stage_generation(&mut batch);
        self.backend.commit(&batch)?;
        self.set_generation(generation);
        report.generation = generation;

        self.refresh_index();
        info!(
            caches = ?report.caches,
            entries = report.entries_scanned,
            keys = report.keys_written,
            generation,
            "rebuild complete"
        );
        Ok(report)
    }

    /// Rebuilds every registered cache in dependency order.
    pub fn rebuild_all(
        &self,
        source: &dyn DirectorySource,
        cancel: &AtomicBool,
    ) -> Result<RebuildReport> {
        let mut total = RebuildReport::default();
        for cache in self.caches()? {
            if cache.is_derived() || total.caches.iter().any(|c| c == cache.name()) {
                continue;
            }
            let report = self.rebuild(cache.name(), source, cancel)?;
            total.entries_scanned += report.entries_scanned;
            total.keys_written += report.keys_written;
            total.generation = report.generation;
            for name in report.caches {
                if !total.caches.contains(&name) {
                    total.caches.push(name);
                }
            }
        }
        Ok(total)
    }

    fn rebuild_one(
        &self,
        cache: &Cache,
        source: &dyn DirectorySource,
        cancel: &AtomicBool,
        report: &mut RebuildReport,
    ) -> Result<()> {
        let name = cache.name();
        let scratch = self.backend.open_scratch(name)?;
        let interrupted = || -> Result<()> {
            self.backend.discard_scratch(name)?;
            warn!(cache = name, "rebuild interrupted, previous content kept");
            Err(CacheError::RebuildInterrupted(format!(
                "rebuild of '{}' cancelled",
                name
            )))
        };

        match cache.kind() {
            CacheKind::Sharded(shards) => {
                let mut content: BTreeMap<String, Values> = BTreeMap::new();
                let mut seen: BTreeSet<String> = BTreeSet::new();
                for shard in shards {
                    for entry in source.search(&shard.filter)? {
                        if cancel.load(Ordering::SeqCst) {
                            return interrupted();
                        }
                        // An entry matched by several shards is applied once
                        if !seen.insert(dn::normalize(&entry.dn)) {
                            continue;
                        }
                        report.entries_scanned += 1;
                        for (key, values) in cache.contribution(Some(&entry)) {
                            content.entry(key).or_default().extend(values);
                        }
                    }
                }
                for (key, values) in &content {
                    if cancel.load(Ordering::SeqCst) {
                        return interrupted();
                    }
                    scratch.put(key, values)?;
                }
                report.keys_written += content.len();
            }
            CacheKind::Derived(rule) => {
                let content = rule.build(self)?;
                for (key, values) in content.iter().filter(|(_, v)| !v.is_empty()) {
                    if cancel.load(Ordering::SeqCst) {
                        return interrupted();
                    }
                    scratch.put(key, values)?;
                }
                report.keys_written += content.len();
            }
        }

        self.backend.promote_scratch(name)?;
        debug!(cache = name, "scratch promoted");
        Ok(())
    }

    /// Caches transitively depending on `name`, in registry order.
    fn dependents_of(&self, name: &str) -> Result<Vec<Arc<Cache>>> {
        let mut reached: BTreeSet<String> = BTreeSet::from([name.to_string()]);
        let mut dependents = Vec::new();
        for cache in self.caches()? {
            if cache.depends_on().iter().any(|d| reached.contains(*d)) {
                reached.insert(cache.name().to_string());
                dependents.push(cache);
            }
        }
        Ok(dependents)
    }

    // == Add Shard ==
    /// Adds a shard class to `cache_name`, creating the cache when needed.
    ///
    /// The cache is marked unbuilt until its next rebuild. Returns false when
    /// the shard was already present.
    pub fn add_shard(&self, cache_name: &str, class_id: &str) -> Result<bool> {
        storage::validate_cache_name(cache_name)?;
        let class = shard::lookup(class_id)?;

        {
            let mut caches = self.caches_write()?;
            match caches.iter().position(|c| c.name() == cache_name) {
                Some(pos) if caches[pos].has_shard(class.id) => return Ok(false),
                Some(pos) => {
                    let extended = caches[pos].with_shard(class.definition())?;
                    caches[pos] = Arc::new(extended);
                }
                None => {
                    let cache =
                        Cache::sharded(cache_name, vec![class.definition()], Arc::clone(&self.backend))?;
                    let at = caches
                        .iter()
                        .position(|c| c.is_derived())
                        .unwrap_or(caches.len());
                    caches.insert(at, Arc::new(cache));
                }
            }
            register_derived(&mut caches, &self.backend)?;
        }

        self.meta.delete(&built_key(cache_name))?;
        for dependent in self.dependents_of(cache_name)? {
            self.meta.delete(&built_key(dependent.name()))?;
        }
        info!(cache = cache_name, shard = class_id, "shard added, rebuild required");
        Ok(true)
    }

    // == Remove Cache ==
    /// Unregisters `name` and drops its content. Refused while another
    /// registered cache depends on it.
    pub fn remove_cache(&self, name: &str) -> Result<()> {
        {
            let mut caches = self.caches_write()?;
            let pos = caches
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| CacheError::Configuration(format!("unknown cache '{}'", name)))?;
            let dependents: Vec<&str> = caches
                .iter()
                .filter(|c| c.depends_on().iter().any(|d| *d == name))
                .map(|c| c.name())
                .collect();
            if !dependents.is_empty() {
                return Err(CacheError::Configuration(format!(
                    "cache '{}' is required by {:?}",
                    name, dependents
                )));
            }
            caches.remove(pos);
        }

        self.backend.remove(name)?;
        self.meta.delete(&built_key(name))?;
        if name == NESTED_GROUPS || name == DIRECT_MEMBERS {
            self.refresh_index();
        }
        info!(cache = name, "cache removed");
        Ok(())
    }

    // == Change Subscriptions ==
    /// Recomputes the filters the change feed has to honour from the
    /// current shard set.
    pub fn regenerate_change_subscriptions(&self) -> Result<ChangeSubscriptions> {
        let mut subscriptions = Vec::new();
        let mut filters: BTreeSet<String> = BTreeSet::new();
        for cache in self.caches()? {
            for shard in cache.shards() {
                let filter = shard.filter.to_string();
                filters.insert(filter.clone());
                subscriptions.push(Subscription {
                    cache: cache.name().to_string(),
                    shard: shard.name.to_string(),
                    filter,
                });
            }
        }

        let filter = match filters.len() {
            0 => String::new(),
            1 => filters.into_iter().next().unwrap_or_default(),
            _ => format!("(|{})", filters.into_iter().collect::<String>()),
        };
        debug!(count = subscriptions.len(), %filter, "change subscriptions regenerated");
        Ok(ChangeSubscriptions {
            subscriptions,
            filter,
        })
    }

    // == Lock Helpers ==
    fn caches_read(&self) -> Result<RwLockReadGuard<'_, Vec<Arc<Cache>>>> {
        self.caches
            .read()
            .map_err(|_| CacheError::Internal("cache table lock poisoned".into()))
    }

    fn caches_write(&self) -> Result<RwLockWriteGuard<'_, Vec<Arc<Cache>>>> {
        self.caches
            .write()
            .map_err(|_| CacheError::Internal("cache table lock poisoned".into()))
    }
}

impl CacheReader for CacheRegistry {
    fn get(&self, cache: &str, key: &str) -> Result<Values> {
        self.cache(cache)?.get(key)
    }

    fn scan(&self, cache: &str) -> Result<BTreeMap<String, Values>> {
        self.cache(cache)?.load()
    }

    fn has_cache(&self, cache: &str) -> bool {
        self.caches_read()
            .map(|caches| caches.iter().any(|c| c.name() == cache))
            .unwrap_or(false)
    }
}

/// Appends each derived cache whose dependencies are all registered. Rules
/// are visited in dependency order, so the result stays acyclic.
fn register_derived(caches: &mut Vec<Arc<Cache>>, backend: &Arc<dyn Backend>) -> Result<()> {
    for rule in DerivedRule::ALL {
        let present = |name: &str| caches.iter().any(|c| c.name() == name);
        if present(rule.cache_name()) || !rule.depends_on().iter().all(|d| present(d)) {
            continue;
        }
        caches.push(Arc::new(Cache::derived(rule, Arc::clone(backend))?));
    }
    Ok(())
}

fn read_generation(meta: &dyn Store) -> Result<u64> {
    match meta.get(GENERATION_KEY)?.iter().next() {
        Some(raw) => raw
            .parse()
            .map_err(|e| CacheError::corrupt(META_STORE, format!("generation: {}", e))),
        None => Ok(0),
    }
}
