//! Shard Module
//!
//! Declarative extraction rules and the closed catalog of shard classes.

mod catalog;
mod definition;

pub use catalog::{all, lookup, ShardClass, CATALOG_VERSION};
pub use definition::{Cardinality, KeyExtractor, ShardDefinition, Transform, ValueExtractor};
