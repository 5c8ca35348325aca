//! Shard Definition Module
//!
//! A shard is a pure extraction rule: a filter plus key and value extractors.
//! Applying it to an entry yields at most one `(key, values)` contribution and
//! never fails; missing or malformed attributes yield `None`.
//!
//! Keys and values longer than `MAX_KEY_LEN` are dropped here: values of one
//! cache become keys of derived caches, and a key the backend refuses would
//! fail the event on every replay.

use std::fmt;

use tracing::{debug, warn};

use crate::directory::{Entry, Filter};
use crate::storage::{Values, MAX_KEY_LEN};

/// Derives the cache key from an entry.
pub type KeyExtractor = fn(&Entry) -> Option<String>;

/// Derives the raw value list from an entry.
pub type ValueExtractor = fn(&Entry) -> Option<Vec<String>>;

// == Cardinality ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Only the first extracted value is kept
    Single,
    Multi,
}

// == Transform ==
/// Normalization applied to every extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    Lowercase,
}

impl Transform {
    fn apply(self, value: String) -> String {
        match self {
            Transform::Identity => value,
            Transform::Lowercase => value.to_lowercase(),
        }
    }
}

// == Shard Definition ==
#[derive(Clone)]
pub struct ShardDefinition {
    /// Shard class identifier this definition was built from
    pub name: &'static str,
    pub filter: Filter,
    pub key: KeyExtractor,
    pub values: ValueExtractor,
    pub cardinality: Cardinality,
    pub transform: Transform,
}

impl ShardDefinition {
    // == Apply ==
    /// Maps one entry to its contribution, if any.
    ///
    /// Returns `None` when the filter does not match, the key cannot be
    /// derived or is too long to store, or no values remain after extraction.
    pub fn apply(&self, entry: &Entry) -> Option<(String, Values)> {
        if !self.filter.matches(entry) {
            return None;
        }

        let Some(key) = (self.key)(entry) else {
            debug!(shard = self.name, dn = %entry.dn, "no key derivable, skipping entry");
            return None;
        };
        if key.len() > MAX_KEY_LEN {
            warn!(shard = self.name, len = key.len(), "key exceeds storable length, skipping entry");
            return None;
        }

        let raw = (self.values)(entry)?;
        let mut values = raw
            .into_iter()
            .filter(|v| !v.is_empty())
            .map(|v| self.transform.apply(v))
            .filter(|v| {
                let fits = v.len() <= MAX_KEY_LEN;
                if !fits {
                    warn!(shard = self.name, dn = %entry.dn, len = v.len(), "value exceeds storable length, dropped");
                }
                fits
            });

        let values: Values = match self.cardinality {
            Cardinality::Single => values.next().into_iter().collect(),
            Cardinality::Multi => values.collect(),
        };

        if values.is_empty() {
            None
        } else {
            Some((key, values))
        }
    }
}

impl fmt::Debug for ShardDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardDefinition")
            .field("name", &self.name)
            .field("filter", &self.filter.to_string())
            .field("cardinality", &self.cardinality)
            .field("transform", &self.transform)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail_shard(cardinality: Cardinality) -> ShardDefinition {
        ShardDefinition {
            name: "test-mail",
            filter: Filter::object_class("person"),
            key: |e| e.first("uid"),
            values: |e| Some(e.strings("mail")),
            cardinality,
            transform: Transform::Lowercase,
        }
    }

    fn person() -> Entry {
        Entry::new("uid=alice,dc=example")
            .with("objectClass", ["person"])
            .with("uid", ["alice"])
            .with("mail", ["Alice@Example.org", "a@example.org", ""])
    }

    #[test]
    fn test_apply_multi() {
        let (key, values) = mail_shard(Cardinality::Multi).apply(&person()).unwrap();
        assert_eq!(key, "alice");
        let expected: Values = ["alice@example.org", "a@example.org"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_apply_single_keeps_first_value() {
        let (_, values) = mail_shard(Cardinality::Single).apply(&person()).unwrap();
        assert_eq!(values.len(), 1);
        assert!(values.contains("alice@example.org"));
    }

    #[test]
    fn test_apply_filter_mismatch() {
        let entry = Entry::new("cn=g").with("objectClass", ["posixGroup"]);
        assert!(mail_shard(Cardinality::Multi).apply(&entry).is_none());
    }

    #[test]
    fn test_apply_missing_attributes_contribute_nothing() {
        let no_key = Entry::new("cn=x").with("objectClass", ["person"]);
        assert!(mail_shard(Cardinality::Multi).apply(&no_key).is_none());

        let no_values = Entry::new("cn=x")
            .with("objectClass", ["person"])
            .with("uid", ["x"]);
        assert!(mail_shard(Cardinality::Multi).apply(&no_values).is_none());
    }

    #[test]
    fn test_apply_skips_oversized_keys_and_values() {
        let long = "x".repeat(MAX_KEY_LEN + 1);
        let entry = Entry::new("uid=bob,dc=example")
            .with("objectClass", ["person"])
            .with("uid", [long.as_str()])
            .with("mail", ["bob@example.org"]);
        assert!(mail_shard(Cardinality::Multi).apply(&entry).is_none());

        let entry = Entry::new("uid=bob,dc=example")
            .with("objectClass", ["person"])
            .with("uid", ["bob"])
            .with("mail", [long.as_str(), "bob@example.org"]);
        let (_, values) = mail_shard(Cardinality::Multi).apply(&entry).unwrap();
        assert_eq!(values.len(), 1);
        assert!(values.contains("bob@example.org"));
    }
}
