//! Repository permission filter
//!
//! Read authorization is expressed as a deny-list: the ids of repositories
//! the acting user may NOT see. Most installations expose nearly every
//! repository, so the list of forbidden ids is far smaller than the list of
//! allowed ones. The filter is consulted once per query and its result is
//! merged with any caller-supplied exclusions.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::context::QueryContext;
use crate::error::Result;
use crate::types::RepoId;

/// Source of the per-request deny-list
#[async_trait]
pub trait PermissionFilter: Send + Sync + 'static {
    /// Repositories the context's actor may not read
    ///
    /// An error fails the query; the store never falls back to "allow all".
    async fn excluded_repository_ids(&self, ctx: &QueryContext) -> Result<Vec<RepoId>>;
}

/// Filter that denies nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionFilter for AllowAll {
    async fn excluded_repository_ids(&self, _ctx: &QueryContext) -> Result<Vec<RepoId>> {
        Ok(Vec::new())
    }
}

/// In-memory deny-lists: one applied to every non-internal actor and one
/// per user on top of it
#[derive(Debug, Default)]
pub struct StaticDenyList {
    global: RwLock<BTreeSet<RepoId>>,
    per_user: RwLock<HashMap<i32, BTreeSet<RepoId>>>,
}

impl StaticDenyList {
    /// Create an empty deny-list
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a global deny-list
    pub fn with_global(ids: impl IntoIterator<Item = RepoId>) -> Self {
        let list = Self::new();
        list.deny_all_users(ids);
        list
    }

    /// Deny repositories to every non-internal actor
    pub fn deny_all_users(&self, ids: impl IntoIterator<Item = RepoId>) {
        self.global.write().extend(ids);
    }

    /// Deny repositories to one user
    pub fn deny_user(&self, user_id: i32, ids: impl IntoIterator<Item = RepoId>) {
        self.per_user.write().entry(user_id).or_default().extend(ids);
    }

    /// Remove every deny entry
    pub fn clear(&self) {
        self.global.write().clear();
        self.per_user.write().clear();
    }
}

#[async_trait]
impl PermissionFilter for StaticDenyList {
    async fn excluded_repository_ids(&self, ctx: &QueryContext) -> Result<Vec<RepoId>> {
        if ctx.actor.internal {
            return Ok(Vec::new());
        }
        let mut denied: BTreeSet<RepoId> = self.global.read().clone();
        if let Some(user_id) = ctx.actor.user_id {
            if let Some(ids) = self.per_user.read().get(&user_id) {
                denied.extend(ids.iter().copied());
            }
        }
        Ok(denied.into_iter().collect())
    }
}

/// Union of the filter's deny-list and the caller's exclusions, sorted and
/// deduplicated
pub fn merge_deny_lists(filter: Vec<RepoId>, caller: &[RepoId]) -> Vec<RepoId> {
    let mut merged = filter;
    merged.extend_from_slice(caller);
    merged.sort_unstable();
    merged.dedup();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_deny_list_merges_user_and_global() {
        let filter = StaticDenyList::with_global([4, 1]);
        filter.deny_user(7, [9, 1]);

        let user = QueryContext::for_user(7);
        assert_eq!(
            filter.excluded_repository_ids(&user).await.unwrap(),
            vec![1, 4, 9]
        );

        let other = QueryContext::for_user(8);
        assert_eq!(
            filter.excluded_repository_ids(&other).await.unwrap(),
            vec![1, 4]
        );

        let internal = QueryContext::background();
        assert!(filter
            .excluded_repository_ids(&internal)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_merge_deny_lists() {
        assert_eq!(merge_deny_lists(vec![3, 1], &[1, 2]), vec![1, 2, 3]);
        assert!(merge_deny_lists(Vec::new(), &[]).is_empty());
    }
}
