//! sled-backed storage: one database directory per cache.
//!
//! Each cache lives in `<root>/<name>.sled` with an `entries` tree for live
//! content and a `rebuild` tree as scratch area. Batches are atomic per cache;
//! a batch spanning several caches is applied cache by cache.
//!
//! sled holds an exclusive lock on each database directory, so readers in
//! other processes must go through this process (or use the LMDB backend).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Transactional, Tree};
use tracing::debug;

use super::{decode_values, encode_values, Backend, BackendKind, Store, StoreIter, Values, WriteBatch};
use crate::error::{CacheError, Result};

const LIVE_TREE: &str = "entries";
const SCRATCH_TREE: &str = "rebuild";

// == Sled Backend ==
pub struct SledBackend {
    root: PathBuf,
    dbs: Mutex<HashMap<String, sled::Db>>,
}

impl SledBackend {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            dbs: Mutex::new(HashMap::new()),
        })
    }

    fn db(&self, cache: &str) -> Result<sled::Db> {
        let mut dbs = self
            .dbs
            .lock()
            .map_err(|_| CacheError::Internal("sled handle table poisoned".into()))?;
        if let Some(db) = dbs.get(cache) {
            return Ok(db.clone());
        }

        let path = self.root.join(format!("{}.sled", cache));
        let db = sled::open(&path)?;
        debug!(cache, path = %path.display(), "sled database opened");
        dbs.insert(cache.to_string(), db.clone());
        Ok(db)
    }

    fn tree(&self, cache: &str, tree: &str) -> Result<Tree> {
        Ok(self.db(cache)?.open_tree(tree)?)
    }
}

impl Backend for SledBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sled
    }

    fn open(&self, cache: &str) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(SledStore {
            name: cache.to_string(),
            tree: self.tree(cache, LIVE_TREE)?,
        }))
    }

    fn open_scratch(&self, cache: &str) -> Result<Arc<dyn Store>> {
        let tree = self.tree(cache, SCRATCH_TREE)?;
        tree.clear()?;
        Ok(Arc::new(SledStore {
            name: cache.to_string(),
            tree,
        }))
    }

    fn promote_scratch(&self, cache: &str) -> Result<()> {
        let live = self.tree(cache, LIVE_TREE)?;
        let scratch = self.tree(cache, SCRATCH_TREE)?;

        // Single writer: nothing else mutates either tree while we collect
        let staged: BTreeMap<IVec, IVec> = scratch.iter().collect::<sled::Result<_>>()?;
        let stale: BTreeSet<IVec> = live
            .iter()
            .keys()
            .collect::<sled::Result<Vec<_>>>()?
            .into_iter()
            .filter(|key| !staged.contains_key(key))
            .collect();

        (&live, &scratch)
            .transaction(|(live_tx, scratch_tx)| {
                for key in &stale {
                    live_tx.remove(key.clone())?;
                }
                for (key, value) in &staged {
                    live_tx.insert(key.clone(), value.clone())?;
                    scratch_tx.remove(key.clone())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| {
                CacheError::StorageIo(format!("sled promote of '{}': {:?}", cache, e))
            })?;

        debug!(cache, entries = staged.len(), "scratch promoted");
        Ok(())
    }

    fn discard_scratch(&self, cache: &str) -> Result<()> {
        self.tree(cache, SCRATCH_TREE)?.clear()?;
        Ok(())
    }

    fn commit(&self, batch: &WriteBatch) -> Result<()> {
        for cache in batch.caches() {
            let mut writes = sled::Batch::default();
            for (key, op) in batch.for_cache(cache) {
                match op {
                    Some(values) => writes.insert(key.as_bytes(), encode_values(values)?),
                    None => writes.remove(key.as_bytes()),
                }
            }
            self.tree(cache, LIVE_TREE)?.apply_batch(writes)?;
        }
        Ok(())
    }

    fn remove(&self, cache: &str) -> Result<()> {
        self.tree(cache, LIVE_TREE)?.clear()?;
        self.tree(cache, SCRATCH_TREE)?.clear()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let dbs: Vec<sled::Db> = self
            .dbs
            .lock()
            .map_err(|_| CacheError::Internal("sled handle table poisoned".into()))?
            .values()
            .cloned()
            .collect();
        for db in dbs {
            db.flush()?;
        }
        Ok(())
    }
}

// == Sled Store ==
struct SledStore {
    name: String,
    tree: Tree,
}

impl Store for SledStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Values> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => decode_values(&self.name, &bytes),
            None => Ok(Values::new()),
        }
    }

    fn put(&self, key: &str, values: &Values) -> Result<()> {
        self.tree.insert(key.as_bytes(), encode_values(values)?)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn iterate(&self) -> StoreIter<'_> {
        let name = self.name.as_str();
        Box::new(self.tree.iter().map(move |item| -> Result<(String, Values)> {
            let (key, bytes) = item?;
            let key = String::from_utf8(key.to_vec()).map_err(|e| CacheError::corrupt(name, e))?;
            Ok((key, decode_values(name, &bytes)?))
        }))
    }

    fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        Ok(())
    }
}
