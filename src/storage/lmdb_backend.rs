//! LMDB-backed storage using the heed crate.
//!
//! All caches share one memory-mapped environment. Each cache owns a named
//! sub-database (`cache:<name>`) plus a scratch sub-database
//! (`scratch:<name>`) that rebuilds write into before promotion.
//!
//! # Isolation
//! LMDB gives readers a consistent snapshot per read transaction and allows
//! exactly one write transaction at a time, so readers in this or other
//! processes never observe a torn write.

use std::collections::{HashMap, VecDeque};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use tracing::debug;

use super::{decode_values, encode_values, Backend, BackendKind, Store, StoreIter, Values, WriteBatch};
use crate::error::{CacheError, Result};

type Db = Database<Str, Bytes>;

const MAX_DBS: u32 = 128;

/// Entries fetched per read transaction while scanning.
const SCAN_CHUNK: usize = 256;

fn live_name(cache: &str) -> String {
    format!("cache:{}", cache)
}

fn scratch_name(cache: &str) -> String {
    format!("scratch:{}", cache)
}

// == LMDB Backend ==
pub struct LmdbBackend {
    env: Env,
    /// Sub-database handles opened so far
    dbs: Mutex<HashMap<String, Db>>,
}

impl LmdbBackend {
    /// Opens or creates the environment under `path`.
    ///
    /// # Arguments
    /// * `path` - Directory holding the LMDB data and lock files
    /// * `map_size_mb` - Maximum size of the map in megabytes
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per process (see
        // `storage::open_backend`) and the files are not modified externally.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(MAX_DBS)
                .open(path.as_ref())
        }?;

        debug!(path = %path.as_ref().display(), "lmdb environment opened");
        Ok(Self {
            env,
            dbs: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves a sub-database handle, creating it on first use.
    ///
    /// Must not be called while this thread holds a write transaction.
    fn database(&self, name: &str) -> Result<Db> {
        let mut dbs = self
            .dbs
            .lock()
            .map_err(|_| CacheError::Internal("lmdb handle table poisoned".into()))?;
        if let Some(db) = dbs.get(name) {
            return Ok(*db);
        }

        let mut wtxn = self.env.write_txn()?;
        let db: Db = self.env.create_database(&mut wtxn, Some(name))?;
        wtxn.commit()?;

        dbs.insert(name.to_string(), db);
        Ok(db)
    }

    fn store(&self, cache: &str, db_name: String) -> Result<Arc<dyn Store>> {
        let db = self.database(&db_name)?;
        Ok(Arc::new(LmdbStore {
            name: cache.to_string(),
            env: self.env.clone(),
            db,
        }))
    }
}

impl Backend for LmdbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lmdb
    }

    fn open(&self, cache: &str) -> Result<Arc<dyn Store>> {
        self.store(cache, live_name(cache))
    }

    fn open_scratch(&self, cache: &str) -> Result<Arc<dyn Store>> {
        let store = self.store(cache, scratch_name(cache))?;
        store.clear()?;
        Ok(store)
    }

    fn promote_scratch(&self, cache: &str) -> Result<()> {
        let live = self.database(&live_name(cache))?;
        let scratch = self.database(&scratch_name(cache))?;

        let mut wtxn = self.env.write_txn()?;
        let staged: Vec<(String, Vec<u8>)> = scratch
            .iter(&wtxn)?
            .map(|item| item.map(|(k, v)| (k.to_string(), v.to_vec())))
            .collect::<std::result::Result<_, _>>()?;

        live.clear(&mut wtxn)?;
        for (key, bytes) in &staged {
            live.put(&mut wtxn, key, bytes)?;
        }
        scratch.clear(&mut wtxn)?;
        wtxn.commit()?;

        debug!(cache, entries = staged.len(), "scratch promoted");
        Ok(())
    }

    fn discard_scratch(&self, cache: &str) -> Result<()> {
        let scratch = self.database(&scratch_name(cache))?;
        let mut wtxn = self.env.write_txn()?;
        scratch.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    fn commit(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut dbs = HashMap::new();
        for cache in batch.caches() {
            dbs.insert(cache, self.database(&live_name(cache))?);
        }

        // Dropping the transaction on any error aborts every write in it
        let mut wtxn = self.env.write_txn()?;
        for (cache, key, op) in batch.iter() {
            let db = dbs[cache];
            match op {
                Some(values) => db.put(&mut wtxn, key, &encode_values(values)?)?,
                None => {
                    db.delete(&mut wtxn, key)?;
                }
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    fn remove(&self, cache: &str) -> Result<()> {
        let live = self.database(&live_name(cache))?;
        let scratch = self.database(&scratch_name(cache))?;
        let mut wtxn = self.env.write_txn()?;
        live.clear(&mut wtxn)?;
        scratch.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

// == LMDB Store ==
struct LmdbStore {
    name: String,
    env: Env,
    db: Db,
}

impl Store for LmdbStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Values> {
        let rtxn = self.env.read_txn()?;
        match self.db.get(&rtxn, key)? {
            Some(bytes) => decode_values(&self.name, bytes),
            None => Ok(Values::new()),
        }
    }

    fn put(&self, key: &str, values: &Values) -> Result<()> {
        let bytes = encode_values(values)?;
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, key, &bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.db.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(())
    }

    fn iterate(&self) -> StoreIter<'_> {
        Box::new(LmdbScan {
            name: &self.name,
            env: &self.env,
            db: self.db,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    fn clear(&self) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.db.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }
}

// == Chunked Scan ==
/// Pages through a sub-database in key order, one short read transaction per
/// chunk, so no transaction is held across calls to `next`.
struct LmdbScan<'a> {
    name: &'a str,
    env: &'a Env,
    db: Db,
    after: Option<String>,
    buffer: VecDeque<(String, Values)>,
    exhausted: bool,
}

impl LmdbScan<'_> {
    fn fill(&mut self) -> Result<()> {
        let rtxn = self.env.read_txn()?;
        let lower: Bound<&str> = match &self.after {
            Some(key) => Bound::Excluded(key.as_str()),
            None => Bound::Unbounded,
        };
        let range = (lower, Bound::Unbounded);

        let mut fetched = 0;
        for item in self.db.range(&rtxn, &range)?.take(SCAN_CHUNK) {
            let (key, bytes) = item?;
            let values = decode_values(self.name, bytes)?;
            self.buffer.push_back((key.to_string(), values));
            fetched += 1;
        }

        if fetched < SCAN_CHUNK {
            self.exhausted = true;
        }
        if let Some((key, _)) = self.buffer.back() {
            self.after = Some(key.clone());
        }
        Ok(())
    }
}

impl Iterator for LmdbScan<'_> {
    type Item = Result<(String, Values)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(items: &[&str]) -> Values {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn create_test_backend() -> (LmdbBackend, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let backend = LmdbBackend::open(temp_dir.path(), 16).expect("backend should open");
        (backend, temp_dir)
    }

    #[test]
    fn test_put_get_delete() {
        let (backend, _dir) = create_test_backend();
        let store = backend.open("uids").unwrap();

        store.put("uid=a,dc=x", &set(&["a"])).unwrap();
        assert_eq!(store.get("uid=a,dc=x").unwrap(), set(&["a"]));

        store.delete("uid=a,dc=x").unwrap();
        assert!(store.get("uid=a,dc=x").unwrap().is_empty());
    }

    #[test]
    fn test_caches_are_isolated() {
        let (backend, _dir) = create_test_backend();
        let a = backend.open("a").unwrap();
        let b = backend.open("b").unwrap();
        a.put("k", &set(&["1"])).unwrap();
        assert!(b.get("k").unwrap().is_empty());
    }

    #[test]
    fn test_iterate_spans_chunks_and_restarts() {
        let (backend, _dir) = create_test_backend();
        let store = backend.open("big").unwrap();
        let total = SCAN_CHUNK * 2 + 7;
        let mut batch = WriteBatch::new();
        for i in 0..total {
            batch.put("big", &format!("key{:05}", i), set(&["v"]));
        }
        backend.commit(&batch).unwrap();

        let keys: Vec<String> = store.iterate().map(|r| r.unwrap().0).collect();
        assert_eq!(keys.len(), total);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        // a second scan starts from the beginning again
        assert_eq!(store.iterate().count(), total);
    }

    #[test]
    fn test_commit_spans_caches() {
        let (backend, _dir) = create_test_backend();
        let mut batch = WriteBatch::new();
        batch.put("a", "k1", set(&["x"]));
        batch.put("b", "k2", set(&["y"]));
        backend.commit(&batch).unwrap();

        assert_eq!(backend.open("a").unwrap().get("k1").unwrap(), set(&["x"]));
        assert_eq!(backend.open("b").unwrap().get("k2").unwrap(), set(&["y"]));

        let mut batch = WriteBatch::new();
        batch.delete("a", "k1");
        backend.commit(&batch).unwrap();
        assert!(backend.open("a").unwrap().get("k1").unwrap().is_empty());
    }

    #[test]
    fn test_promote_replaces_live_content() {
        let (backend, _dir) = create_test_backend();
        let live = backend.open("c").unwrap();
        live.put("old", &set(&["1"])).unwrap();
        live.put("kept", &set(&["1"])).unwrap();

        let scratch = backend.open_scratch("c").unwrap();
        scratch.put("kept", &set(&["2"])).unwrap();
        scratch.put("new", &set(&["3"])).unwrap();

        // live content is untouched until promotion
        assert_eq!(live.get("old").unwrap(), set(&["1"]));

        backend.promote_scratch("c").unwrap();
        assert!(live.get("old").unwrap().is_empty());
        assert_eq!(live.get("kept").unwrap(), set(&["2"]));
        assert_eq!(live.get("new").unwrap(), set(&["3"]));
        assert_eq!(scratch.iterate().count(), 0);
    }

    #[test]
    fn test_discarded_scratch_leaves_live_intact() {
        let (backend, _dir) = create_test_backend();
        let live = backend.open("c").unwrap();
        live.put("k", &set(&["1"])).unwrap();

        let scratch = backend.open_scratch("c").unwrap();
        scratch.put("k", &set(&["half-written"])).unwrap();
        backend.discard_scratch("c").unwrap();

        assert_eq!(live.get("k").unwrap(), set(&["1"]));
    }

    #[test]
    fn test_rewrite_is_byte_identical() {
        let (backend, _dir) = create_test_backend();
        let store = backend.open("c").unwrap();
        store.put("k", &set(&["b", "a"])).unwrap();
        let env = &backend.env;
        let db = backend.database(&live_name("c")).unwrap();
        let first = {
            let rtxn = env.read_txn().unwrap();
            db.get(&rtxn, "k").unwrap().unwrap().to_vec()
        };
        store.put("k", &set(&["a", "b"])).unwrap();
        let second = {
            let rtxn = env.read_txn().unwrap();
            db.get(&rtxn, "k").unwrap().unwrap().to_vec()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_value_is_reported() {
        let (backend, _dir) = create_test_backend();
        let store = backend.open("c").unwrap();
        let db = backend.database(&live_name("c")).unwrap();
        {
            let mut wtxn = backend.env.write_txn().unwrap();
            db.put(&mut wtxn, "k", b"not json").unwrap();
            wtxn.commit().unwrap();
        }
        assert!(matches!(
            store.get("k"),
            Err(CacheError::CacheCorrupt { .. })
        ));
        assert!(store.iterate().any(|r| r.is_err()));
    }
}
