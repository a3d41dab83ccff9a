use crate::GroupRef;
use std::{fmt, str::FromStr};

/// A namespace whose role binding tracks the membership of a directory group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncTarget {
    pub namespace: String,
    pub group: GroupRef,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid sync target {0:?}: expected <namespace>:<group-email>")]
pub struct InvalidTarget(pub String);

// === impl SyncTarget ===

impl SyncTarget {
    pub fn new(namespace: impl Into<String>, group: impl Into<GroupRef>) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
        }
    }

    /// Parses a comma-delimited list of `namespace:group` pairs.
    ///
    /// Blank entries (e.g. from a trailing comma) are ignored. Order is
    /// preserved and duplicates are kept.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, InvalidTarget> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| entry.parse::<Self>())
            .collect()
    }
}

impl FromStr for SyncTarget {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, group) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| InvalidTarget(s.to_string()))?;
        let (namespace, group) = (namespace.trim(), group.trim());
        if namespace.is_empty() || group.is_empty() || group.contains(':') {
            return Err(InvalidTarget(s.to_string()));
        }
        Ok(Self::new(namespace, group))
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.group)
    }
}
