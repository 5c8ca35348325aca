//! Query Frontend Module
//!
//! Read-only entry point for membership questions. Queries never mutate
//! caches and fail with `StaleCache` instead of answering from caches that
//! were never built.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{
    CacheReader, CacheRegistry, DIRECT_MEMBERS, NESTED_GROUPS, NESTED_USER_GROUPS, USER_GROUPS,
};
use crate::directory::dn;
use crate::error::Result;
use crate::query::closure;
use crate::storage::Values;

// == Query Frontend ==
#[derive(Clone)]
pub struct QueryFrontend {
    registry: Arc<CacheRegistry>,
}

impl QueryFrontend {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self { registry }
    }

    // == Groups For User ==
    /// Groups containing `user_dn`.
    ///
    /// # Arguments
    /// * `user_dn` - User DN, normalized before lookup
    /// * `consider_nested_groups` - Include groups reached through nesting
    pub fn groups_for_user(&self, user_dn: &str, consider_nested_groups: bool) -> Result<Values> {
        if consider_nested_groups {
            self.registry.ensure_built(&[USER_GROUPS, NESTED_GROUPS])?;
        } else {
            self.registry.ensure_built(&[USER_GROUPS])?;
        }
        let groups = closure::groups_for_user(self.registry.as_ref(), user_dn, consider_nested_groups)?;
        debug!(user = user_dn, nested = consider_nested_groups, count = groups.len(), "groups_for_user");
        Ok(groups)
    }

    // == Users In Group ==
    /// Users contained in `group_dn`.
    pub fn users_in_group(&self, group_dn: &str, consider_nested_groups: bool) -> Result<Values> {
        if consider_nested_groups {
            self.registry.ensure_built(&[DIRECT_MEMBERS, NESTED_GROUPS])?;
        } else {
            self.registry.ensure_built(&[DIRECT_MEMBERS])?;
        }
        let users = closure::users_in_group(self.registry.as_ref(), group_dn, consider_nested_groups)?;
        debug!(group = group_dn, nested = consider_nested_groups, count = users.len(), "users_in_group");
        Ok(users)
    }

    // == Effective Groups ==
    /// Precomputed transitive groups of `user_dn`, read from a single cache.
    pub fn effective_groups(&self, user_dn: &str) -> Result<Values> {
        self.registry.ensure_built(&[NESTED_USER_GROUPS])?;
        self.registry.get(NESTED_USER_GROUPS, &dn::normalize(user_dn))
    }
}
