//! Index Module
//!
//! In-memory reverse index of group membership edges, persisted next to the
//! caches so a restart does not have to rebuild it.

mod membership;

pub use membership::{Member, MemberKind, MembershipEdge, MembershipIndex};
