//! Response DTOs for the group cache API
//!
//! Defines the structure of outgoing HTTP response bodies.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cache::IngestStats;
use crate::ingest::IngestReport;
use crate::storage::Values;

/// Response body for the membership lookups
#[derive(Debug, Clone, Serialize)]
pub struct MembershipResponse {
    /// DN the lookup was made for
    pub dn: String,
    pub nested: bool,
    pub count: usize,
    /// Resulting DNs in sorted order
    pub results: Vec<String>,
}

impl MembershipResponse {
    pub fn new(dn: impl Into<String>, nested: bool, results: Values) -> Self {
        Self {
            dn: dn.into(),
            nested,
            count: results.len(),
            results: results.into_iter().collect(),
        }
    }
}

/// Response body for POST /events
#[derive(Debug, Clone, Serialize)]
pub struct EventResponse {
    pub dn: String,
    pub generation: u64,
    pub keys_written: usize,
    pub keys_deleted: usize,
    /// Cache name → number of keys changed
    pub caches: BTreeMap<String, usize>,
}

impl From<IngestReport> for EventResponse {
    fn from(report: IngestReport) -> Self {
        Self {
            keys_written: report.keys_written(),
            keys_deleted: report.keys_deleted,
            caches: report
                .touched
                .iter()
                .map(|(cache, keys)| (cache.clone(), keys.len()))
                .collect(),
            dn: report.dn,
            generation: report.generation,
        }
    }
}

/// Response body for POST /admin/caches/:name/shards
#[derive(Debug, Clone, Serialize)]
pub struct ShardResponse {
    pub cache: String,
    pub shard_class: String,
    /// False when the shard was already present
    pub added: bool,
    pub rebuild_required: bool,
}

/// Response body for DELETE /admin/caches/:name
#[derive(Debug, Clone, Serialize)]
pub struct RemoveResponse {
    pub cache: String,
    pub message: String,
}

impl RemoveResponse {
    pub fn new(cache: impl Into<String>) -> Self {
        let cache = cache.into();
        Self {
            message: format!("Cache '{}' removed", cache),
            cache,
        }
    }
}

/// Per-cache part of the stats response
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub name: String,
    /// `sharded` or `derived`
    pub kind: &'static str,
    pub shards: Vec<String>,
    pub built: bool,
    pub entries: usize,
}

/// Membership index part of the stats response
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub generation: u64,
    pub groups: usize,
    pub edges: usize,
    pub stale: bool,
}

/// Response body for GET /stats
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub backend: String,
    pub generation: u64,
    pub ingest: IngestStats,
    /// Fraction of events rejected since startup
    pub failure_rate: f64,
    pub index: IndexStatus,
    pub caches: Vec<CacheStatus>,
}

/// Response body for the health check endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
