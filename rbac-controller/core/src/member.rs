use ahash::AHashSet as HashSet;
use std::{fmt, hash};

/// Identifies a directory group, usually by its email address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupRef(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberKind {
    User,
    Group,
}

/// A single directory entry.
///
/// Members are compared by identity alone: the same email reported once as a
/// user and once as a group is the same member.
#[derive(Clone, Debug)]
pub struct Member {
    id: String,
    kind: MemberKind,
}

/// Users resolved from a group, in first-seen order with no repeated
/// identities.
///
/// The order is what ends up as the subject order of a role binding, so it
/// must be stable for a stable directory.
#[derive(Clone, Debug, Default)]
pub struct MembershipSet {
    members: Vec<Member>,
    ids: HashSet<String>,
}

/// Removes repeated identities, keeping the first occurrence of each.
pub fn dedup(members: impl IntoIterator<Item = Member>) -> MembershipSet {
    members.into_iter().collect()
}

// === impl GroupRef ===

impl GroupRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for GroupRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for GroupRef {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for GroupRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// === impl MemberKind ===

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => "USER".fmt(f),
            Self::Group => "GROUP".fmt(f),
        }
    }
}

// === impl Member ===

impl Member {
    pub fn new(id: impl Into<String>, kind: MemberKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, MemberKind::User)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(id, MemberKind::Group)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn is_group(&self) -> bool {
        self.kind == MemberKind::Group
    }

    /// Returns the group this member refers to, if it is a group.
    pub fn as_group(&self) -> Option<GroupRef> {
        self.is_group().then(|| GroupRef::new(self.id.clone()))
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Member {}

impl hash::Hash for Member {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.kind)
    }
}

// === impl MembershipSet ===

impl MembershipSet {
    /// Appends `member` unless its identity is already present. Returns true
    /// if the member was added.
    pub fn insert(&mut self, member: Member) -> bool {
        if self.ids.contains(&member.id) {
            return false;
        }
        self.ids.insert(member.id.clone());
        self.members.push(member);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Member> {
        self.members.iter()
    }

    /// Member identities in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.members.iter().map(Member::id)
    }

    pub fn into_vec(self) -> Vec<Member> {
        self.members
    }
}

impl FromIterator<Member> for MembershipSet {
    fn from_iter<I: IntoIterator<Item = Member>>(iter: I) -> Self {
        let mut set = Self::default();
        set.extend(iter);
        set
    }
}

impl Extend<Member> for MembershipSet {
    fn extend<I: IntoIterator<Item = Member>>(&mut self, iter: I) {
        for member in iter {
            self.insert(member);
        }
    }
}

impl IntoIterator for MembershipSet {
    type Item = Member;
    type IntoIter = std::vec::IntoIter<Member>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_iter()
    }
}

impl<'a> IntoIterator for &'a MembershipSet {
    type Item = &'a Member;
    type IntoIter = std::slice::Iter<'a, Member>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

impl PartialEq for MembershipSet {
    fn eq(&self, other: &Self) -> bool {
        self.members == other.members
    }
}

impl Eq for MembershipSet {}
