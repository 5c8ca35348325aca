//! Storage Module
//!
//! Interchangeable embedded key-value backends behind one contract:
//! `put`, `get`, `delete`, `iterate`, `clear`.
//!
//! # Backends
//! - `lmdb`: one shared environment, one sub-database per cache, writes of a
//!   `WriteBatch` commit in a single transaction
//! - `sled`: one database directory per cache, batches are atomic per cache
//!
//! Exactly one backend kind may be opened per process.

mod codec;
mod lmdb_backend;
mod sled_backend;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::error::{CacheError, Result};

pub use codec::{decode_values, encode_values};
pub use lmdb_backend::LmdbBackend;
pub use sled_backend::SledBackend;

/// A cache entry's value set. Ordered, so encoding is deterministic.
pub type Values = BTreeSet<String>;

/// Lazy, finite sequence of stored entries.
pub type StoreIter<'a> = Box<dyn Iterator<Item = Result<(String, Values)>> + 'a>;

/// Reserved store holding build markers and the ingest generation.
pub const META_STORE: &str = "__meta__";

/// Longest key, in bytes, either backend stores. LMDB's default build
/// rejects anything longer; sled shares the limit so both backends hold
/// the same content.
pub const MAX_KEY_LEN: usize = 511;

// == Backend Kind ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Lmdb,
    Sled,
}

impl FromStr for BackendKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lmdb" => Ok(BackendKind::Lmdb),
            "sled" => Ok(BackendKind::Sled),
            other => Err(CacheError::Configuration(format!(
                "unknown storage backend '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Lmdb => write!(f, "lmdb"),
            BackendKind::Sled => write!(f, "sled"),
        }
    }
}

// == Store ==
/// Handle to one named cache's key space.
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    /// Values stored under `key`, empty when absent.
    fn get(&self, key: &str) -> Result<Values>;

    fn put(&self, key: &str, values: &Values) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Restartable scan over all entries in key order.
    fn iterate(&self) -> StoreIter<'_>;

    fn clear(&self) -> Result<()>;
}

// == Backend ==
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Opens (creating if needed) the live store of `cache`.
    fn open(&self, cache: &str) -> Result<Arc<dyn Store>>;

    /// Opens the emptied scratch area used while rebuilding `cache`.
    fn open_scratch(&self, cache: &str) -> Result<Arc<dyn Store>>;

    /// Atomically replaces the live content of `cache` with its scratch area.
    fn promote_scratch(&self, cache: &str) -> Result<()>;

    fn discard_scratch(&self, cache: &str) -> Result<()>;

    /// Applies all writes of a batch; atomically across caches when the
    /// backend supports it.
    fn commit(&self, batch: &WriteBatch) -> Result<()>;

    /// Drops all content of `cache`, live and scratch.
    fn remove(&self, cache: &str) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

// == Write Batch ==
/// Pending writes keyed by `(cache, key)`; a later write to the same key
/// replaces the earlier one. `None` marks a delete.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: BTreeMap<(String, String), Option<Values>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `values` for `key`; an empty set stages a delete.
    pub fn put(&mut self, cache: &str, key: &str, values: Values) {
        let op = if values.is_empty() { None } else { Some(values) };
        self.ops.insert((cache.to_string(), key.to_string()), op);
    }

    pub fn delete(&mut self, cache: &str, key: &str) {
        self.ops.insert((cache.to_string(), key.to_string()), None);
    }

    /// Staged state of a key: `None` when untouched, `Some(None)` when
    /// staged for deletion.
    pub fn staged(&self, cache: &str, key: &str) -> Option<Option<&Values>> {
        self.ops
            .get(&(cache.to_string(), key.to_string()))
            .map(|op| op.as_ref())
    }

    /// Staged writes of one cache.
    pub fn for_cache<'a>(
        &'a self,
        cache: &'a str,
    ) -> impl Iterator<Item = (&'a str, Option<&'a Values>)> + 'a {
        self.ops
            .iter()
            .filter(move |((c, _), _)| c == cache)
            .map(|((_, k), op)| (k.as_str(), op.as_ref()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, Option<&Values>)> {
        self.ops
            .iter()
            .map(|((c, k), op)| (c.as_str(), k.as_str(), op.as_ref()))
    }

    pub fn caches(&self) -> BTreeSet<&str> {
        self.ops.keys().map(|(c, _)| c.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// == Backend Selection ==
static ACTIVE_BACKEND: OnceLock<BackendKind> = OnceLock::new();

/// Opens the configured backend, refusing a second kind in this process.
pub fn open_backend(config: &Config) -> Result<Arc<dyn Backend>> {
    let active = *ACTIVE_BACKEND.get_or_init(|| config.backend);
    if active != config.backend {
        return Err(CacheError::Configuration(format!(
            "backend '{}' already active in this process, refusing '{}'",
            active, config.backend
        )));
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Lmdb => Arc::new(LmdbBackend::open(
            config.data_dir.join("lmdb"),
            config.lmdb_map_size_mb,
        )?),
        BackendKind::Sled => Arc::new(SledBackend::open(config.data_dir.join("sled"))?),
    };
    Ok(backend)
}

/// Cache names become database and directory names.
pub(crate) fn validate_cache_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CacheError::Configuration(format!(
            "invalid cache name '{}'",
            name
        )))
    }
}
