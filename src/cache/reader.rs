//! Read access to cache content, live or with pending writes overlaid.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::storage::{Values, WriteBatch};

// == Cache Reader ==
/// Read-only view over named caches.
pub trait CacheReader {
    /// Values of `key` in `cache`; empty when absent.
    fn get(&self, cache: &str, key: &str) -> Result<Values>;

    /// Full content of `cache`.
    fn scan(&self, cache: &str) -> Result<BTreeMap<String, Values>>;

    fn has_cache(&self, cache: &str) -> bool;

    fn keys(&self, cache: &str) -> Result<Vec<String>> {
        Ok(self.scan(cache)?.into_keys().collect())
    }
}

// == Staged Reader ==
/// A reader that sees the writes staged in a batch before they are committed.
pub struct StagedReader<'a> {
    base: &'a dyn CacheReader,
    batch: &'a WriteBatch,
}

impl<'a> StagedReader<'a> {
    pub fn new(base: &'a dyn CacheReader, batch: &'a WriteBatch) -> Self {
        Self { base, batch }
    }
}

impl CacheReader for StagedReader<'_> {
    fn get(&self, cache: &str, key: &str) -> Result<Values> {
        match self.batch.staged(cache, key) {
            Some(Some(values)) => Ok(values.clone()),
            Some(None) => Ok(Values::new()),
            None => self.base.get(cache, key),
        }
    }

    fn scan(&self, cache: &str) -> Result<BTreeMap<String, Values>> {
        let mut content = self.base.scan(cache)?;
        for (key, op) in self.batch.for_cache(cache) {
            match op {
                Some(values) => {
                    content.insert(key.to_string(), values.clone());
                }
                None => {
                    content.remove(key);
                }
            }
        }
        Ok(content)
    }

    fn has_cache(&self, cache: &str) -> bool {
        self.base.has_cache(cache)
    }
}

/// Plain in-memory caches, for tests and offline computation.
impl CacheReader for BTreeMap<String, BTreeMap<String, Values>> {
    fn get(&self, cache: &str, key: &str) -> Result<Values> {
        Ok(BTreeMap::get(self, cache)
            .and_then(|c| c.get(key))
            .cloned()
            .unwrap_or_default())
    }

    fn scan(&self, cache: &str) -> Result<BTreeMap<String, Values>> {
        Ok(BTreeMap::get(self, cache).cloned().unwrap_or_default())
    }

    fn has_cache(&self, cache: &str) -> bool {
        self.contains_key(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> Values {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn base() -> BTreeMap<String, BTreeMap<String, Values>> {
        BTreeMap::from([(
            "c".to_string(),
            BTreeMap::from([
                ("a".to_string(), set(&["1"])),
                ("b".to_string(), set(&["2"])),
            ]),
        )])
    }

    #[test]
    fn test_staged_reader_overlays_batch() {
        let base = base();
        let mut batch = WriteBatch::new();
        batch.delete("c", "a");
        batch.put("c", "z", set(&["9"]));

        let reader = StagedReader::new(&base, &batch);
        assert!(reader.get("c", "a").unwrap().is_empty());
        assert_eq!(reader.get("c", "b").unwrap(), set(&["2"]));
        assert_eq!(reader.get("c", "z").unwrap(), set(&["9"]));

        let keys: Vec<_> = reader.scan("c").unwrap().into_keys().collect();
        assert_eq!(keys, vec!["b", "z"]);
    }

    #[test]
    fn test_map_reader_unknown_cache_is_empty() {
        let base = base();
        assert!(CacheReader::get(&base, "other", "a").unwrap().is_empty());
        assert!(!base.has_cache("other"));
        assert_eq!(CacheReader::keys(&base, "c").unwrap(), vec!["a", "b"]);
    }
}
