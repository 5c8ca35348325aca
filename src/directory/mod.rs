//! Directory Module
//!
//! The engine's view of directory data: entries, change events, DN handling,
//! the small filter language used by shards, and the snapshot source that
//! feeds full rebuilds.

pub mod dn;
mod entry;
mod filter;
mod source;

pub use entry::{Attributes, ChangeEvent, Entry, Operation};
pub use filter::Filter;
pub use source::{DirectorySource, MemoryDirectory};
