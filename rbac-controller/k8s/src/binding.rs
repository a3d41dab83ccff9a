use crate::{ObjectMeta, RoleBinding, RoleRef, Subject};
use chrono::{DateTime, Utc};
use maplit::{btreemap, convert_args};
use rbac_sync_controller_core::{MembershipSet, SyncTarget};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub const MANAGER_NAME: &str = "rbac-sync-controller";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const LAST_SYNC_ANNOTATION: &str = "rbac-sync.io/last-sync-time";

/// The role binding a namespace should have, computed from a resolved group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredBinding {
    pub namespace: String,
    pub name: String,
    pub role_ref: String,
    pub subjects: Vec<String>,
    pub synced_at: DateTime<Utc>,
}

// === impl DesiredBinding ===

impl DesiredBinding {
    pub fn new(
        target: &SyncTarget,
        members: &MembershipSet,
        name: impl Into<String>,
        role_ref: impl Into<String>,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace: target.namespace.clone(),
            name: name.into(),
            role_ref: role_ref.into(),
            subjects: members.ids().map(str::to_string).collect(),
            synced_at,
        }
    }

    /// The full object written to the cluster. Every managed field is set so
    /// that an update replaces whatever the binding held before.
    pub fn to_role_binding(&self) -> RoleBinding {
        let subjects = self
            .subjects
            .iter()
            .map(|name| Subject {
                api_group: Some(RBAC_API_GROUP.to_string()),
                kind: "User".to_string(),
                name: name.clone(),
                namespace: None,
            })
            .collect();

        RoleBinding {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(convert_args!(btreemap!(
                    MANAGED_BY_LABEL => MANAGER_NAME,
                ))),
                annotations: Some(convert_args!(btreemap!(
                    LAST_SYNC_ANNOTATION => self.synced_at.format(TIMESTAMP_FORMAT).to_string(),
                ))),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: self.role_ref.clone(),
            },
            subjects: Some(subjects),
        }
    }
}
