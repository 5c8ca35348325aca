//! Query Module
//!
//! Membership lookups over the caches, direct and transitive.

pub mod closure;
mod frontend;

pub use closure::{groups_for_user, users_in_group, NestedParents};
pub use frontend::QueryFrontend;
