#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod binding;
mod reconcile;

pub use self::{
    binding::{DesiredBinding, LAST_SYNC_ANNOTATION, MANAGED_BY_LABEL, MANAGER_NAME},
    reconcile::{Applied, ApplyError, BindingConfig, BindingReconciler, ClusterClient},
};
pub use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
pub use kube::{
    api::{Api, ObjectMeta, PostParams},
    Client, Error,
};
