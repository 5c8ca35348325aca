//! Directory entries and change events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw attribute map: attribute name to its list of binary values.
pub type Attributes = BTreeMap<String, Vec<Vec<u8>>>;

// == Entry ==
/// One directory object as seen by the shards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attrs: Attributes,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: Attributes::new(),
        }
    }

    /// Builder helper: appends string values to `attr`.
    pub fn with<I, S>(mut self, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let slot = self.attrs.entry(attr.to_string()).or_default();
        slot.extend(values.into_iter().map(|v| v.as_ref().as_bytes().to_vec()));
        self
    }

    /// Raw values of `attr`; attribute names match case-insensitively.
    pub fn raw_values(&self, attr: &str) -> &[Vec<u8>] {
        self.attrs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attr))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// UTF-8 values of `attr`. Values that are not valid UTF-8 are skipped.
    pub fn strings(&self, attr: &str) -> Vec<String> {
        self.raw_values(attr)
            .iter()
            .filter_map(|v| std::str::from_utf8(v).ok())
            .map(str::to_string)
            .collect()
    }

    /// First UTF-8 value of `attr`.
    pub fn first(&self, attr: &str) -> Option<String> {
        self.strings(attr).into_iter().next()
    }

    /// Case-insensitive value test, as LDAP equality matching does for
    /// objectClass and friends.
    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.raw_values(attr)
            .iter()
            .filter_map(|v| std::str::from_utf8(v).ok())
            .any(|v| v.eq_ignore_ascii_case(value))
    }

    pub fn has_attr(&self, attr: &str) -> bool {
        !self.raw_values(attr).is_empty()
    }
}

// == Operation ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Modify,
    Delete,
    Rename,
}

// == Change Event ==
/// A create/modify/delete/rename notification for one directory entry.
///
/// For `Rename`, `dn` is the new name and `old_dn` the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub dn: String,
    pub old_dn: Option<String>,
    pub old_attrs: Attributes,
    pub new_attrs: Attributes,
    pub operation: Operation,
}

impl ChangeEvent {
    pub fn add(entry: Entry) -> Self {
        Self {
            dn: entry.dn,
            old_dn: None,
            old_attrs: Attributes::new(),
            new_attrs: entry.attrs,
            operation: Operation::Add,
        }
    }

    pub fn modify(old: Entry, new: Entry) -> Self {
        Self {
            dn: new.dn,
            old_dn: None,
            old_attrs: old.attrs,
            new_attrs: new.attrs,
            operation: Operation::Modify,
        }
    }

    pub fn delete(entry: Entry) -> Self {
        Self {
            dn: entry.dn,
            old_dn: None,
            old_attrs: entry.attrs,
            new_attrs: Attributes::new(),
            operation: Operation::Delete,
        }
    }

    pub fn rename(old: Entry, new: Entry) -> Self {
        Self {
            dn: new.dn,
            old_dn: Some(old.dn),
            old_attrs: old.attrs,
            new_attrs: new.attrs,
            operation: Operation::Rename,
        }
    }

    /// State of the entry before the change, if it existed.
    pub fn old_entry(&self) -> Option<Entry> {
        if self.operation == Operation::Add || self.old_attrs.is_empty() {
            return None;
        }
        Some(Entry {
            dn: self.old_dn.clone().unwrap_or_else(|| self.dn.clone()),
            attrs: self.old_attrs.clone(),
        })
    }

    /// State of the entry after the change, if it still exists.
    pub fn new_entry(&self) -> Option<Entry> {
        if self.operation == Operation::Delete || self.new_attrs.is_empty() {
            return None;
        }
        Some(Entry {
            dn: self.dn.clone(),
            attrs: self.new_attrs.clone(),
        })
    }
}
