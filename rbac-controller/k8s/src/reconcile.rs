use crate::{Api, Client, DesiredBinding, PostParams, RoleBinding, MANAGER_NAME};
use chrono::Utc;
use rbac_sync_controller_core::{MembershipSet, SyncTarget};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{debug, info, instrument};

/// Writes role bindings to the cluster.
///
/// Both operations send the complete object; `replace` overwrites the named
/// binding unconditionally and fails with a 404 if it does not exist.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, kube::Error>;

    async fn create(&self, namespace: &str, binding: &RoleBinding)
        -> Result<RoleBinding, kube::Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingConfig {
    /// The cluster role every managed binding refers to.
    pub cluster_role: String,
    /// The name of the managed binding in each namespace.
    pub binding_name: String,
    /// Bounds each write to the cluster.
    pub write_timeout: Duration,
}

/// Turns resolved group memberships into role bindings.
#[derive(Clone, Debug)]
pub struct BindingReconciler<C> {
    client: C,
    config: BindingConfig,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Replaced,
    Created,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to write rolebinding {namespace}/{name}")]
    Api {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("timed out writing rolebinding {namespace}/{name} after {timeout:?}")]
    Timeout {
        namespace: String,
        name: String,
        timeout: Duration,
    },
}

// === impl BindingReconciler ===

impl<C: ClusterClient> BindingReconciler<C> {
    pub fn new(client: C, config: BindingConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    /// Overwrites the target namespace's binding so that its subjects are
    /// exactly `members`.
    ///
    /// A binding that does not exist yet is created. Nothing is retried; the
    /// next pass is the retry.
    #[instrument(skip_all, fields(namespace = %target.namespace, group = %target.group))]
    pub async fn reconcile(
        &self,
        target: &SyncTarget,
        members: &MembershipSet,
    ) -> Result<Applied, ApplyError> {
        let desired = DesiredBinding::new(
            target,
            members,
            &self.config.binding_name,
            &self.config.cluster_role,
            Utc::now(),
        );
        let binding = desired.to_role_binding();
        let DesiredBinding {
            namespace, name, ..
        } = &desired;

        match self
            .write(namespace, name, self.client.replace(namespace, name, &binding))
            .await
        {
            Ok(_) => {
                info!(%name, subjects = desired.subjects.len(), "Replaced rolebinding");
                Ok(Applied::Replaced)
            }
            Err(ApplyError::Api {
                source: kube::Error::Api(rsp),
                ..
            }) if rsp.code == 404 => {
                debug!(%name, "Rolebinding not found; creating it");
                self.write(namespace, name, self.client.create(namespace, &binding))
                    .await?;
                info!(%name, subjects = desired.subjects.len(), "Created rolebinding");
                Ok(Applied::Created)
            }
            Err(error) => Err(error),
        }
    }

    async fn write(
        &self,
        namespace: &str,
        name: &str,
        call: impl std::future::Future<Output = Result<RoleBinding, kube::Error>>,
    ) -> Result<RoleBinding, ApplyError> {
        let timeout = self.config.write_timeout;
        match time::timeout(timeout, call).await {
            Ok(Ok(binding)) => Ok(binding),
            Ok(Err(source)) => Err(ApplyError::Api {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            }),
            Err(_) => Err(ApplyError::Timeout {
                namespace: namespace.to_string(),
                name: name.to_string(),
                timeout,
            }),
        }
    }
}

// === impl ApplyError ===

impl ApplyError {
    /// Indicates the cluster rejected our credentials or permissions.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::Api {
                source: kube::Error::Api(rsp),
                ..
            } if rsp.code == 401 || rsp.code == 403
        )
    }
}

#[async_trait::async_trait]
impl<C: ClusterClient + ?Sized> ClusterClient for Arc<C> {
    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, kube::Error> {
        (**self).replace(namespace, name, binding).await
    }

    async fn create(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, kube::Error> {
        (**self).create(namespace, binding).await
    }
}

// === impl ClusterClient for kube::Client ===

#[async_trait::async_trait]
impl ClusterClient for Client {
    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, kube::Error> {
        Api::<RoleBinding>::namespaced(self.clone(), namespace)
            .replace(name, &post_params(), binding)
            .await
    }

    async fn create(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, kube::Error> {
        Api::<RoleBinding>::namespaced(self.clone(), namespace)
            .create(&post_params(), binding)
            .await
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(MANAGER_NAME.to_string()),
        ..Default::default()
    }
}
