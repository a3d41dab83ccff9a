use crate::{DirectoryClient, GroupRef, Member, MembershipSet};
use ahash::AHashSet as HashSet;
use tracing::{debug, instrument};

/// Expands a directory group into the users it contains, directly or through
/// nested groups.
#[derive(Clone, Debug)]
pub struct MembershipResolver<D> {
    directory: D,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to list members of group {group}")]
    Fetch {
        group: GroupRef,
        #[source]
        source: anyhow::Error,
    },

    #[error("group {group} is a member of itself through {}", path.join(" -> "))]
    Cycle { group: GroupRef, path: Vec<String> },
}

/// A group whose members are still being walked.
struct Frame {
    group: GroupRef,
    members: std::vec::IntoIter<Member>,
}

// === impl MembershipResolver ===

impl<D: DirectoryClient> MembershipResolver<D> {
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    /// Resolves the users of `group`, depth first, in first-seen order.
    ///
    /// Fails if any group in the expansion cannot be listed, or if a group
    /// contains itself transitively; no partial result is ever returned. A
    /// group reachable through more than one path is only listed once.
    #[instrument(skip_all, fields(%group))]
    pub async fn resolve(&self, group: &GroupRef) -> Result<MembershipSet, ResolveError> {
        let mut users = MembershipSet::default();
        let mut expanded = HashSet::new();
        let mut path = vec![self.expand(group).await?];

        loop {
            let next = match path.last_mut() {
                Some(frame) => frame.members.next(),
                None => break,
            };

            let member = match next {
                Some(member) => member,
                None => {
                    if let Some(Frame { group, .. }) = path.pop() {
                        expanded.insert(group);
                    }
                    continue;
                }
            };

            let nested = match member.as_group() {
                Some(nested) => nested,
                None => {
                    users.insert(member);
                    continue;
                }
            };

            if path.iter().any(|frame| frame.group == nested) {
                let path = path
                    .iter()
                    .map(|frame| frame.group.to_string())
                    .chain(Some(nested.to_string()))
                    .collect();
                return Err(ResolveError::Cycle {
                    group: nested,
                    path,
                });
            }
            if expanded.contains(&nested) {
                debug!(group = %nested, "Group already expanded");
                continue;
            }

            path.push(self.expand(&nested).await?);
        }

        debug!(users = users.len(), "Resolved group");
        Ok(users)
    }

    async fn expand(&self, group: &GroupRef) -> Result<Frame, ResolveError> {
        let members = self
            .directory
            .list_members(group)
            .await
            .map_err(|source| ResolveError::Fetch {
                group: group.clone(),
                source,
            })?;
        debug!(%group, members = members.len(), "Listed group");
        Ok(Frame {
            group: group.clone(),
            members: members.into_iter(),
        })
    }
}

impl ResolveError {
    /// The group at which resolution failed.
    pub fn group(&self) -> &GroupRef {
        match self {
            Self::Fetch { group, .. } | Self::Cycle { group, .. } => group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Directory {
        groups: HashMap<String, Vec<Member>>,
        broken: HashSet<String>,
        listed: Mutex<Vec<String>>,
    }

    impl Directory {
        fn group(mut self, id: &str, members: Vec<Member>) -> Self {
            self.groups.insert(id.to_string(), members);
            self
        }

        fn broken(mut self, id: &str) -> Self {
            self.broken.insert(id.to_string());
            self
        }
    }

    #[async_trait::async_trait]
    impl DirectoryClient for Directory {
        async fn list_members(&self, group: &GroupRef) -> anyhow::Result<Vec<Member>> {
            self.listed.lock().push(group.to_string());
            if self.broken.contains(group.as_str()) {
                anyhow::bail!("directory unavailable");
            }
            self.groups
                .get(group.as_str())
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("group not found"))
        }
    }

    fn ids(set: &MembershipSet) -> Vec<&str> {
        set.ids().collect()
    }

    #[tokio::test]
    async fn flat_group_in_page_order() {
        let directory = Directory::default().group(
            "g1@x.com",
            vec![
                Member::user("carol@x.com"),
                Member::user("alice@x.com"),
                Member::user("carol@x.com"),
                Member::user("bob@x.com"),
            ],
        );
        let resolver = MembershipResolver::new(directory);

        let users = resolver.resolve(&"g1@x.com".into()).await.expect("resolves");
        assert_eq!(ids(&users), ["carol@x.com", "alice@x.com", "bob@x.com"]);
    }

    #[tokio::test]
    async fn nested_group_is_spliced_in_place() {
        let directory = Directory::default()
            .group(
                "top@x.com",
                vec![
                    Member::user("u1@x.com"),
                    Member::group("nested@x.com"),
                    Member::user("u3@x.com"),
                    Member::user("u2@x.com"),
                ],
            )
            .group(
                "nested@x.com",
                vec![Member::user("u2@x.com"), Member::user("u4@x.com")],
            );
        let resolver = MembershipResolver::new(directory);

        let users = resolver.resolve(&"top@x.com".into()).await.expect("resolves");
        assert_eq!(ids(&users), ["u1@x.com", "u2@x.com", "u4@x.com", "u3@x.com"]);
        assert!(users.iter().all(|m| !m.is_group()));
    }

    #[tokio::test]
    async fn deep_failure_fails_everything() {
        let directory = Directory::default()
            .group(
                "top@x.com",
                vec![Member::user("u1@x.com"), Member::group("mid@x.com")],
            )
            .group(
                "mid@x.com",
                vec![Member::user("u2@x.com"), Member::group("leaf@x.com")],
            )
            .broken("leaf@x.com");
        let resolver = MembershipResolver::new(directory);

        let error = resolver
            .resolve(&"top@x.com".into())
            .await
            .expect_err("must fail");
        assert!(matches!(error, ResolveError::Fetch { .. }));
        assert_eq!(error.group().as_str(), "leaf@x.com");
    }

    #[tokio::test]
    async fn top_level_failure() {
        let resolver = MembershipResolver::new(Directory::default().broken("g@x.com"));
        let error = resolver.resolve(&"g@x.com".into()).await.expect_err("must fail");
        assert_eq!(error.group().as_str(), "g@x.com");
    }

    #[tokio::test]
    async fn cycles_are_rejected() {
        let directory = Directory::default()
            .group("a@x.com", vec![Member::user("u@x.com"), Member::group("b@x.com")])
            .group("b@x.com", vec![Member::group("a@x.com")]);
        let resolver = MembershipResolver::new(directory);

        let error = resolver.resolve(&"a@x.com".into()).await.expect_err("must fail");
        match error {
            ResolveError::Cycle { group, path } => {
                assert_eq!(group.as_str(), "a@x.com");
                assert_eq!(path, ["a@x.com", "b@x.com", "a@x.com"]);
            }
            error => panic!("unexpected error: {error}"),
        }
    }

    #[tokio::test]
    async fn self_membership_is_a_cycle() {
        let directory =
            Directory::default().group("a@x.com", vec![Member::group("a@x.com")]);
        let resolver = MembershipResolver::new(directory);

        let error = resolver.resolve(&"a@x.com".into()).await.expect_err("must fail");
        assert!(matches!(error, ResolveError::Cycle { .. }));
    }

    #[tokio::test]
    async fn shared_subgroup_is_listed_once() {
        let directory = Directory::default()
            .group(
                "a@x.com",
                vec![Member::group("b@x.com"), Member::group("c@x.com")],
            )
            .group(
                "b@x.com",
                vec![Member::group("d@x.com"), Member::user("b-user@x.com")],
            )
            .group(
                "c@x.com",
                vec![Member::user("c-user@x.com"), Member::group("d@x.com")],
            )
            .group("d@x.com", vec![Member::user("d-user@x.com")]);
        let resolver = MembershipResolver::new(directory);

        let users = resolver.resolve(&"a@x.com".into()).await.expect("resolves");
        assert_eq!(
            ids(&users),
            ["d-user@x.com", "b-user@x.com", "c-user@x.com"]
        );
        assert_eq!(
            *resolver.directory.listed.lock(),
            ["a@x.com", "b@x.com", "d@x.com", "c@x.com"]
        );
    }
}
