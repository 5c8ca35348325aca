//! Configuration Module
//!
//! Handles loading and managing service configuration from environment variables.
//! The shard list is read once at start and treated as static until restart.

use std::env;
use std::path::PathBuf;

use crate::error::{CacheError, Result};
use crate::shard;
use crate::storage::BackendKind;

/// Shard classes enabled when `GROUP_CACHE_SHARDS` is unset.
pub const DEFAULT_SHARDS: &[&str] = &["direct-members", "nested-groups", "user-uid"];

/// Service configuration parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage backend used for every cache in this process
    pub backend: BackendKind,
    /// Root directory of all persisted state
    pub data_dir: PathBuf,
    /// Active shard-class identifiers, in configuration order
    pub shard_classes: Vec<String>,
    /// HTTP server port
    pub server_port: u16,
    /// Seconds between MembershipIndex persistence runs
    pub index_flush_interval: u64,
    /// LMDB map size in megabytes
    pub lmdb_map_size_mb: usize,
    /// Capacity of the single-writer job queue
    pub event_queue_depth: usize,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `GROUP_CACHE_BACKEND` - `lmdb` or `sled` (default: lmdb)
    /// - `GROUP_CACHE_DIR` - data directory (default: /var/lib/group-cache)
    /// - `GROUP_CACHE_SHARDS` - comma separated shard classes
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `INDEX_FLUSH_INTERVAL` - seconds (default: 30)
    /// - `LMDB_MAP_SIZE_MB` - (default: 256)
    /// - `EVENT_QUEUE_DEPTH` - (default: 1024)
    ///
    /// Fails with a configuration error on an unknown backend or shard class.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let backend = match env::var("GROUP_CACHE_BACKEND") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.backend,
        };

        let shard_classes = match env::var("GROUP_CACHE_SHARDS") {
            Ok(raw) => parse_list(&raw),
            Err(_) => defaults.shard_classes,
        };

        let config = Self {
            backend,
            data_dir: env::var("GROUP_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            shard_classes,
            server_port: env::var("SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.server_port),
            index_flush_interval: env::var("INDEX_FLUSH_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.index_flush_interval),
            lmdb_map_size_mb: env::var("LMDB_MAP_SIZE_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lmdb_map_size_mb),
            event_queue_depth: env::var("EVENT_QUEUE_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.event_queue_depth),
        };

        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration rooted at `data_dir` with default shards.
    pub fn with_data_dir(backend: BackendKind, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    // == Validate ==
    /// Rejects shard-class identifiers the catalog does not know.
    pub fn validate(&self) -> Result<()> {
        if self.shard_classes.is_empty() {
            return Err(CacheError::Configuration(
                "no shard classes configured".to_string(),
            ));
        }
        for id in &self.shard_classes {
            shard::lookup(id)?;
        }
        if self.event_queue_depth == 0 {
            return Err(CacheError::Configuration(
                "EVENT_QUEUE_DEPTH must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the persisted MembershipIndex.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("membership-index.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Lmdb,
            data_dir: PathBuf::from("/var/lib/group-cache"),
            shard_classes: DEFAULT_SHARDS.iter().map(|s| s.to_string()).collect(),
            server_port: 3000,
            index_flush_interval: 30,
            lmdb_map_size_mb: 256,
            event_queue_depth: 1024,
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
