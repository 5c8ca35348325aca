//! Cache Entry Module
//!
//! One key of a cache together with its value set.

use serde::Serialize;

use crate::storage::Values;

// == Cache Entry ==
/// A single `(key, values)` pair as stored in a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    /// Normalized key, usually an entry DN
    pub key: String,
    /// Deduplicated value set; never empty for a stored entry
    pub values: Values,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry from any iterator of values.
    ///
    /// # Arguments
    /// * `key` - The cache key
    /// * `values` - Values, deduplicated on collection
    pub fn new<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    // == Is Empty ==
    /// An empty entry is equivalent to an absent key.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.contains(value)
    }
}

impl From<(String, Values)> for CacheEntry {
    fn from((key, values): (String, Values)) -> Self {
        Self { key, values }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_deduplicates_values() {
        let entry = CacheEntry::new("uid=alice,dc=example", ["cn=a", "cn=b", "cn=a"]);
        assert_eq!(entry.values.len(), 2);
        assert!(entry.contains("cn=b"));
        assert!(!entry.is_empty());
    }

    #[test]
    fn test_entry_from_pair() {
        let entry: CacheEntry = ("k".to_string(), Values::new()).into();
        assert_eq!(entry.key, "k");
        assert!(entry.is_empty());
    }
}
