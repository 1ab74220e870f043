use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use api_types::Environment;
use api_types::Function;
use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::Client;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::k8s::cluster::ClusterClient;
use crate::k8s::cluster::DefinitionStore;
use crate::k8s::cluster::KubeResult;
use crate::k8s::types::BackendKind;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::LabeledObject;

/// [`ClusterClient`] and [`DefinitionStore`] backed by the Kubernetes API.
///
/// Every request is bounded by `timeout`; a request that does not finish in
/// time fails with [`KubernetesError::Timeout`] like any other error.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn call<T>(
        &self,
        target: String,
        request: impl Future<Output = kube::Result<T>>,
    ) -> KubeResult<T> {
        bounded(self.timeout, target, request).await
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster_wide<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    async fn list_in<K>(
        &self,
        kind: BackendKind,
        namespace: &str,
        label_key: &str,
    ) -> KubeResult<Vec<LabeledObject>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let api: Api<K> = self.namespaced(namespace);
        let params = ListParams::default().labels(label_key);
        let list = self
            .call(describe(&kind.to_string(), namespace, "*"), api.list(&params))
            .await?;
        Ok(list
            .items
            .iter()
            .map(|item| LabeledObject::from_meta(item.meta(), namespace))
            .collect())
    }

    async fn delete_in<K>(&self, kind: BackendKind, namespace: &str, name: &str) -> KubeResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let api: Api<K> = self.namespaced(namespace);
        self.call(
            describe(&kind.to_string(), namespace, name),
            api.delete(name, &DeleteParams::default()),
        )
        .await
        .map(|_| ())
    }

    async fn get_from<K>(&self, api: Api<K>, kind: &str, namespace: &str, name: &str) -> KubeResult<K>
    where
        K: Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        self.call(describe(kind, namespace, name), api.get(name)).await
    }

    async fn create_in<K>(&self, api: Api<K>, kind: &str, object: &K) -> KubeResult<K>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        self.call(
            describe_object(kind, object),
            api.create(&PostParams::default(), object),
        )
        .await
    }

    async fn replace_in<K>(&self, api: Api<K>, kind: &str, object: &K) -> KubeResult<K>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        self.call(
            describe_object(kind, object),
            api.replace(&name, &PostParams::default(), object),
        )
        .await
    }
}

fn describe(kind: &str, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{kind} {name}")
    } else {
        format!("{kind} {namespace}/{name}")
    }
}

fn describe_object<K: Resource>(kind: &str, object: &K) -> String {
    let meta = object.meta();
    describe(
        kind,
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

fn object_namespace<K: Resource>(object: &K) -> String {
    object.meta().namespace.clone().unwrap_or_default()
}

/// Runs one API request, turning a request that outlives `timeout` into
/// [`KubernetesError::Timeout`].
async fn bounded<T>(
    timeout: Duration,
    target: String,
    request: impl Future<Output = kube::Result<T>>,
) -> KubeResult<T> {
    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(classify(target, err)),
        Err(_) => Err(Report::new(KubernetesError::Timeout { target, timeout })),
    }
}

fn classify(target: String, err: kube::Error) -> Report<KubernetesError> {
    let context = match &err {
        kube::Error::Api(response) if response.code == 404 => KubernetesError::NotFound { target },
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            KubernetesError::AlreadyExists { target }
        }
        kube::Error::Api(response) if response.code == 409 => KubernetesError::Conflict { target },
        _ => KubernetesError::RequestFailed { target },
    };
    Report::new(err).change_context(context)
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_labeled(
        &self,
        kind: BackendKind,
        namespace: &str,
        label_key: &str,
    ) -> KubeResult<Vec<LabeledObject>> {
        match kind {
            BackendKind::Service => self.list_in::<Service>(kind, namespace, label_key).await,
            BackendKind::HorizontalPodAutoscaler => {
                self.list_in::<HorizontalPodAutoscaler>(kind, namespace, label_key)
                    .await
            }
            BackendKind::Deployment => self.list_in::<Deployment>(kind, namespace, label_key).await,
            BackendKind::ReplicaSet => self.list_in::<ReplicaSet>(kind, namespace, label_key).await,
            BackendKind::Pod => self.list_in::<Pod>(kind, namespace, label_key).await,
        }
    }

    async fn delete_object(&self, kind: BackendKind, namespace: &str, name: &str) -> KubeResult<()> {
        match kind {
            BackendKind::Service => self.delete_in::<Service>(kind, namespace, name).await,
            BackendKind::HorizontalPodAutoscaler => {
                self.delete_in::<HorizontalPodAutoscaler>(kind, namespace, name)
                    .await
            }
            BackendKind::Deployment => self.delete_in::<Deployment>(kind, namespace, name).await,
            BackendKind::ReplicaSet => self.delete_in::<ReplicaSet>(kind, namespace, name).await,
            BackendKind::Pod => self.delete_in::<Pod>(kind, namespace, name).await,
        }
    }

    async fn create_service(&self, service: &Service) -> KubeResult<()> {
        let api: Api<Service> = self.namespaced(&object_namespace(service));
        self.create_in(api, "service", service).await.map(|_| ())
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> KubeResult<ServiceAccount> {
        self.get_from(self.namespaced(namespace), "serviceaccount", namespace, name)
            .await
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> KubeResult<ServiceAccount> {
        let api: Api<ServiceAccount> = self.namespaced(&object_namespace(account));
        self.create_in(api, "serviceaccount", account).await
    }

    async fn get_cluster_role(&self, name: &str) -> KubeResult<ClusterRole> {
        self.get_from(self.cluster_wide(), "clusterrole", "", name).await
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> KubeResult<ClusterRole> {
        self.create_in(self.cluster_wide(), "clusterrole", role).await
    }

    async fn get_cluster_role_binding(&self, name: &str) -> KubeResult<ClusterRoleBinding> {
        self.get_from(self.cluster_wide(), "clusterrolebinding", "", name)
            .await
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBinding> {
        self.create_in(self.cluster_wide(), "clusterrolebinding", binding)
            .await
    }

    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBinding> {
        self.replace_in(self.cluster_wide(), "clusterrolebinding", binding)
            .await
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> KubeResult<RoleBinding> {
        self.get_from(self.namespaced(namespace), "rolebinding", namespace, name)
            .await
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> KubeResult<RoleBinding> {
        let api: Api<RoleBinding> = self.namespaced(&object_namespace(binding));
        self.create_in(api, "rolebinding", binding).await
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> KubeResult<RoleBinding> {
        let api: Api<RoleBinding> = self.namespaced(&object_namespace(binding));
        self.replace_in(api, "rolebinding", binding).await
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> KubeResult<()> {
        let api: Api<RoleBinding> = self.namespaced(namespace);
        self.call(
            describe("rolebinding", namespace, name),
            api.delete(name, &DeleteParams::default()),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl DefinitionStore for KubeCluster {
    async fn list_environments(&self) -> KubeResult<Vec<Environment>> {
        let api: Api<Environment> = self.cluster_wide();
        let list = self
            .call(
                describe("environment", "", "*"),
                api.list(&ListParams::default()),
            )
            .await?;
        Ok(list.items)
    }

    async fn get_function(&self, namespace: &str, name: &str) -> KubeResult<Function> {
        self.get_from(self.namespaced(namespace), "function", namespace, name)
            .await
    }

    async fn list_functions(&self, namespace: &str) -> KubeResult<Vec<Function>> {
        let api: Api<Function> = self.namespaced(namespace);
        let list = self
            .call(
                describe("function", namespace, "*"),
                api.list(&ListParams::default()),
            )
            .await?;
        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::k8s::types::is_already_exists;
    use crate::k8s::types::is_not_found;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classify_maps_status_codes() {
        assert!(is_not_found(&classify(
            "pod ns/a".to_string(),
            api_error(404, "NotFound")
        )));
        assert!(is_already_exists(&classify(
            "service ns/a".to_string(),
            api_error(409, "AlreadyExists")
        )));
        assert!(matches!(
            classify("rolebinding ns/a".to_string(), api_error(409, "Conflict")).current_context(),
            KubernetesError::Conflict { .. }
        ));
        assert!(matches!(
            classify("pod ns/a".to_string(), api_error(500, "InternalError")).current_context(),
            KubernetesError::RequestFailed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_times_out() {
        let stalled = std::future::pending::<kube::Result<()>>();

        let err = bounded(Duration::from_secs(30), "pod ns/a".to_string(), stalled)
            .await
            .unwrap_err();

        match err.current_context() {
            KubernetesError::Timeout { target, timeout } => {
                assert_eq!(target, "pod ns/a");
                assert_eq!(*timeout, Duration::from_secs(30));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_failure_is_classified_not_timed_out() {
        let failing = async { Err::<(), _>(api_error(404, "NotFound")) };

        let err = bounded(Duration::from_secs(30), "pod ns/a".to_string(), failing)
            .await
            .unwrap_err();

        assert!(is_not_found(&err));
    }

    #[test]
    fn describe_omits_empty_namespace() {
        assert_eq!(describe("clusterrole", "", "package-getter"), "clusterrole package-getter");
        assert_eq!(describe("pod", "fission-function", "p1"), "pod fission-function/p1");
    }
}
