//! Ingest Module
//!
//! Applies directory change events to the caches incrementally.

mod ingester;

pub use ingester::{ChangeIngester, IngestReport};
