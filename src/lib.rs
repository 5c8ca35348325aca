//! Group Cache - persistent group-membership caches for a directory service
//!
//! Derives named key→value-set caches from directory entries, keeps them
//! current from change notifications, and answers direct and nested
//! membership queries from them.

pub mod api;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod index;
pub mod ingest;
pub mod models;
pub mod query;
pub mod shard;
pub mod storage;
pub mod tasks;

pub use api::AppState;
pub use cache::CacheRegistry;
pub use config::Config;
pub use error::{CacheError, Result};
pub use ingest::ChangeIngester;
pub use query::QueryFrontend;
pub use tasks::{spawn_flush_task, spawn_writer};
