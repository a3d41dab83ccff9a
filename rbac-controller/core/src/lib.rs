#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod member;
pub mod resolve;
mod target;

pub use self::{
    member::{dedup, GroupRef, Member, MemberKind, MembershipSet},
    resolve::{MembershipResolver, ResolveError},
    target::{InvalidTarget, SyncTarget},
};
use std::sync::Arc;

/// Lists the immediate members of a directory group.
///
/// Implementations return every direct member of the group, users and nested
/// groups alike, in the order the directory reports them. Nested groups are
/// not expanded; that is the job of [`MembershipResolver`].
#[async_trait::async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn list_members(&self, group: &GroupRef) -> anyhow::Result<Vec<Member>>;
}

#[async_trait::async_trait]
impl<D: DirectoryClient + ?Sized> DirectoryClient for Arc<D> {
    async fn list_members(&self, group: &GroupRef) -> anyhow::Result<Vec<Member>> {
        (**self).list_members(group).await
    }
}
