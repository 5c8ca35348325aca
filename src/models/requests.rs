//! Request DTOs for the group cache API
//!
//! Defines the structure of incoming HTTP request bodies and query strings.
//! Attribute values travel as UTF-8 strings.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::directory::{Attributes, ChangeEvent, Entry, Operation};

/// Attribute name → string values, as posted by clients.
pub type AttributeMap = BTreeMap<String, Vec<String>>;

fn to_attributes(map: AttributeMap) -> Attributes {
    map.into_iter()
        .map(|(name, values)| (name, values.into_iter().map(String::into_bytes).collect()))
        .collect()
}

/// One directory entry in a request body.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryPayload {
    pub dn: String,
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl From<EntryPayload> for Entry {
    fn from(payload: EntryPayload) -> Self {
        Entry {
            dn: payload.dn,
            attrs: to_attributes(payload.attributes),
        }
    }
}

/// Request body for POST /events
///
/// # Fields
/// - `operation`: add, modify, delete or rename
/// - `dn`: DN of the entry (the new DN for a rename)
/// - `old_dn`: previous DN, renames only
/// - `old_attributes` / `new_attributes`: entry state before and after
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEventRequest {
    pub operation: Operation,
    pub dn: String,
    #[serde(default)]
    pub old_dn: Option<String>,
    #[serde(default)]
    pub old_attributes: AttributeMap,
    #[serde(default)]
    pub new_attributes: AttributeMap,
}

impl ChangeEventRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.dn.trim().is_empty() {
            return Some("dn cannot be empty".to_string());
        }
        match self.operation {
            Operation::Add if self.new_attributes.is_empty() => {
                Some("add requires new_attributes".to_string())
            }
            Operation::Delete if self.old_attributes.is_empty() => {
                Some("delete requires old_attributes".to_string())
            }
            Operation::Rename if self.old_dn.as_deref().map_or(true, |d| d.trim().is_empty()) => {
                Some("rename requires old_dn".to_string())
            }
            _ => None,
        }
    }

    pub fn into_event(self) -> ChangeEvent {
        ChangeEvent {
            dn: self.dn,
            old_dn: self.old_dn,
            old_attrs: to_attributes(self.old_attributes),
            new_attrs: to_attributes(self.new_attributes),
            operation: self.operation,
        }
    }
}

/// Request body for POST /admin/caches/:name/rebuild
#[derive(Debug, Clone, Deserialize)]
pub struct RebuildRequest {
    /// Snapshot of the directory the cache is rebuilt from
    pub entries: Vec<EntryPayload>,
}

/// Request body for POST /admin/caches/:name/shards
#[derive(Debug, Clone, Deserialize)]
pub struct AddShardRequest {
    pub shard_class: String,
}

/// Query string of the membership lookups
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipQuery {
    pub dn: String,
    #[serde(default)]
    pub nested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_request_deserialize() {
        let json = r#"{
            "operation": "modify",
            "dn": "cn=staff,dc=example",
            "old_attributes": {"memberUid": ["alice"]},
            "new_attributes": {"memberUid": ["alice", "bob"]}
        }"#;
        let req: ChangeEventRequest = serde_json::from_str(json).unwrap();
        assert!(req.validate().is_none());

        let event = req.into_event();
        assert_eq!(event.operation, Operation::Modify);
        assert_eq!(event.new_entry().unwrap().strings("memberUid").len(), 2);
    }

    #[test]
    fn test_validate_rename_without_old_dn() {
        let json = r#"{"operation": "rename", "dn": "cn=new,dc=example"}"#;
        let req: ChangeEventRequest = serde_json::from_str(json).unwrap();
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_validate_empty_dn() {
        let json = r#"{"operation": "add", "dn": " ", "new_attributes": {"a": ["b"]}}"#;
        let req: ChangeEventRequest = serde_json::from_str(json).unwrap();
        assert!(req.validate().is_some());
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let json = r#"{"operation": "merge", "dn": "cn=x"}"#;
        assert!(serde_json::from_str::<ChangeEventRequest>(json).is_err());
    }

    #[test]
    fn test_membership_query_defaults_to_direct() {
        let query: MembershipQuery = serde_json::from_str(r#"{"dn": "uid=a"}"#).unwrap();
        assert!(!query.nested);
    }

    #[test]
    fn test_entry_payload_into_entry() {
        let json = r#"{"dn": "uid=a,dc=x", "attributes": {"uid": ["a"]}}"#;
        let entry: Entry = serde_json::from_str::<EntryPayload>(json).unwrap().into();
        assert_eq!(entry.first("uid").as_deref(), Some("a"));
    }
}
