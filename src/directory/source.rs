//! Directory snapshots used for full rebuilds.

use std::collections::BTreeMap;

use super::{dn, ChangeEvent, Entry, Filter};
use crate::error::Result;

/// Anything that can enumerate the entries matching a filter.
///
/// The directory server itself lives outside this crate; rebuilds only need
/// a consistent snapshot of its entries.
pub trait DirectorySource {
    fn search(&self, filter: &Filter) -> Result<Vec<Entry>>;
}

// == Memory Directory ==
/// In-memory entry set keyed by normalized DN.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    entries: BTreeMap<String, Entry>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entry.
    pub fn upsert(&mut self, entry: Entry) {
        self.entries.insert(dn::normalize(&entry.dn), entry);
    }

    pub fn remove(&mut self, entry_dn: &str) -> Option<Entry> {
        self.entries.remove(&dn::normalize(entry_dn))
    }

    pub fn get(&self, entry_dn: &str) -> Option<&Entry> {
        self.entries.get(&dn::normalize(entry_dn))
    }

    /// Applies a change event so the snapshot tracks the live directory.
    pub fn apply(&mut self, event: &ChangeEvent) {
        if let Some(old) = event.old_entry() {
            self.remove(&old.dn);
        }
        if let Some(new) = event.new_entry() {
            self.upsert(new);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Entry> for MemoryDirectory {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        let mut directory = Self::new();
        for entry in iter {
            directory.upsert(entry);
        }
        directory
    }
}

impl DirectorySource for MemoryDirectory {
    fn search(&self, filter: &Filter) -> Result<Vec<Entry>> {
        Ok(self
            .entries
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect())
    }
}
