use rbac_sync_controller_core::{DirectoryClient, GroupRef, Member};
use tracing::debug;

const FAKE_MEMBER: &str = "fake-user@example.com";

/// Answers every group lookup with the same synthetic user, without touching
/// the network.
#[derive(Clone, Debug)]
pub struct FakeDirectory {
    member: Member,
}

// === impl FakeDirectory ===

impl FakeDirectory {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: Member::user(member),
        }
    }
}

impl Default for FakeDirectory {
    fn default() -> Self {
        Self::new(FAKE_MEMBER)
    }
}

#[async_trait::async_trait]
impl DirectoryClient for FakeDirectory {
    async fn list_members(&self, group: &GroupRef) -> anyhow::Result<Vec<Member>> {
        debug!(%group, member = %self.member, "Returning fake membership");
        Ok(vec![self.member.clone()])
    }
}
