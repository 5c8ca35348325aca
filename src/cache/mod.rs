//! Cache Module
//!
//! Named derived indexes over directory data, the registry that owns them,
//! and the staged read view used while an event is being applied.

mod derived;
mod entry;
mod reader;
mod registry;
mod stats;
mod store;


// Re-export public types
pub use derived::{ChangeSet, DerivedRule, KeyChange, Propagation};
pub use entry::CacheEntry;
pub use reader::{CacheReader, StagedReader};
pub use registry::{CacheRegistry, ChangeSubscriptions, RebuildReport, Subscription};
pub use stats::IngestStats;
pub use store::{Cache, CacheKind};

// == Well-Known Cache Names ==
/// Group DN → users listed in both membership attributes
pub const DIRECT_MEMBERS: &str = "direct-members";

/// Group DN → subgroup DNs
pub const NESTED_GROUPS: &str = "nested-groups";

/// Account DN → uid
pub const UIDS: &str = "uids";

/// User DN → groups listing the user directly
pub const USER_GROUPS: &str = "user-groups";

/// User DN → every group the user belongs to, nesting resolved
pub const NESTED_USER_GROUPS: &str = "nested-user-groups";
