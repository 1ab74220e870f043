//! Seams between the executor and the cluster.
//!
//! Every component receives these as explicitly constructed trait objects, so
//! the production [`KubeCluster`](super::KubeCluster) and the in-memory
//! [`FakeCluster`](super::fake::FakeCluster) are interchangeable.

use api_types::Environment;
use api_types::Function;
use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::rbac::v1::RoleBinding;

use crate::k8s::types::BackendKind;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::LabeledObject;

pub type KubeResult<T> = Result<T, Report<KubernetesError>>;

/// Access to backend, access-control and routing objects.
///
/// Namespaced objects passed to `create_*`/`replace_*` carry their namespace
/// in their metadata.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Lists objects of `kind` in `namespace` that carry the label `label_key`
    /// (any value).
    async fn list_labeled(
        &self,
        kind: BackendKind,
        namespace: &str,
        label_key: &str,
    ) -> KubeResult<Vec<LabeledObject>>;

    async fn delete_object(&self, kind: BackendKind, namespace: &str, name: &str) -> KubeResult<()>;

    async fn create_service(&self, service: &Service) -> KubeResult<()>;

    async fn get_service_account(&self, namespace: &str, name: &str) -> KubeResult<ServiceAccount>;
    async fn create_service_account(&self, account: &ServiceAccount) -> KubeResult<ServiceAccount>;

    async fn get_cluster_role(&self, name: &str) -> KubeResult<ClusterRole>;
    async fn create_cluster_role(&self, role: &ClusterRole) -> KubeResult<ClusterRole>;

    async fn get_cluster_role_binding(&self, name: &str) -> KubeResult<ClusterRoleBinding>;
    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBinding>;
    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBinding>;

    async fn get_role_binding(&self, namespace: &str, name: &str) -> KubeResult<RoleBinding>;
    async fn create_role_binding(&self, binding: &RoleBinding) -> KubeResult<RoleBinding>;
    async fn replace_role_binding(&self, binding: &RoleBinding) -> KubeResult<RoleBinding>;
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> KubeResult<()>;
}

/// Read-only view of the declared functions and environments.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Lists environments across all namespaces.
    async fn list_environments(&self) -> KubeResult<Vec<Environment>>;

    async fn get_function(&self, namespace: &str, name: &str) -> KubeResult<Function>;

    async fn list_functions(&self, namespace: &str) -> KubeResult<Vec<Function>>;
}
