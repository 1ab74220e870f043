//! In-memory cluster used by tests
//!
//! `FakeCluster` implements both [`ClusterClient`] and [`DefinitionStore`]
//! over plain maps, with switches for injecting listing and deletion
//! failures. Semantics follow the API server where the executor depends on
//! them: `create_*` fails with `AlreadyExists`, `get`/`delete` with
//! `NotFound`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use api_types::Environment;
use api_types::Function;
use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::Resource;
use kube::ResourceExt;

use crate::k8s::cluster::ClusterClient;
use crate::k8s::cluster::DefinitionStore;
use crate::k8s::cluster::KubeResult;
use crate::k8s::types::BackendKind;
use crate::k8s::types::KubeObjectRef;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::LabeledObject;

type NamespacedKey = (String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<(BackendKind, String, String), LabeledObject>,
    services: BTreeMap<NamespacedKey, Service>,
    service_accounts: BTreeMap<NamespacedKey, ServiceAccount>,
    cluster_roles: BTreeMap<String, ClusterRole>,
    cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    role_bindings: BTreeMap<NamespacedKey, RoleBinding>,
    functions: BTreeMap<NamespacedKey, Function>,
    environments: BTreeMap<NamespacedKey, Environment>,
    failing_lists: BTreeSet<BackendKind>,
    failing_deletes: BTreeSet<String>,
    fail_environment_list: bool,
    deleted: Vec<KubeObjectRef>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn not_found(target: String) -> Report<KubernetesError> {
    Report::new(KubernetesError::NotFound { target })
}

fn already_exists(target: String) -> Report<KubernetesError> {
    Report::new(KubernetesError::AlreadyExists { target })
}

fn namespaced_key<K: Resource>(object: &K) -> NamespacedKey {
    (
        object.meta().namespace.clone().unwrap_or_default(),
        object.meta().name.clone().unwrap_or_default(),
    )
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a backend object with the given labels.
    pub fn insert_object(
        &self,
        kind: BackendKind,
        namespace: &str,
        name: &str,
        labels: &[(&str, &str)],
    ) {
        let object = LabeledObject {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: labels
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        };
        self.state()
            .objects
            .insert((kind, namespace.to_string(), name.to_string()), object);
    }

    pub fn contains_object(&self, kind: BackendKind, namespace: &str, name: &str) -> bool {
        self.state()
            .objects
            .contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    pub fn object_count(&self, kind: BackendKind) -> usize {
        self.state()
            .objects
            .keys()
            .filter(|(object_kind, _, _)| *object_kind == kind)
            .count()
    }

    /// Objects removed through `delete_object`, in deletion order.
    pub fn deleted(&self) -> Vec<KubeObjectRef> {
        self.state().deleted.clone()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        self.state()
            .service_accounts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn cluster_role(&self, name: &str) -> Option<ClusterRole> {
        self.state().cluster_roles.get(name).cloned()
    }

    pub fn cluster_role_binding(&self, name: &str) -> Option<ClusterRoleBinding> {
        self.state().cluster_role_bindings.get(name).cloned()
    }

    pub fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
        self.state()
            .role_bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn role_binding_count(&self) -> usize {
        self.state().role_bindings.len()
    }

    pub fn insert_function(&self, function: Function) {
        self.state()
            .functions
            .insert(namespaced_key(&function), function);
    }

    pub fn remove_function(&self, namespace: &str, name: &str) -> Option<Function> {
        self.state()
            .functions
            .remove(&(namespace.to_string(), name.to_string()))
    }

    pub fn insert_environment(&self, environment: Environment) {
        self.state()
            .environments
            .insert(namespaced_key(&environment), environment);
    }

    pub fn fail_list(&self, kind: BackendKind) {
        self.state().failing_lists.insert(kind);
    }

    /// Makes every deletion of an object with this name fail with a
    /// transient error.
    pub fn fail_delete(&self, name: &str) {
        self.state().failing_deletes.insert(name.to_string());
    }

    pub fn set_fail_environment_list(&self, fail: bool) {
        self.state().fail_environment_list = fail;
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_labeled(
        &self,
        kind: BackendKind,
        namespace: &str,
        label_key: &str,
    ) -> KubeResult<Vec<LabeledObject>> {
        let state = self.state();
        if state.failing_lists.contains(&kind) {
            return Err(Report::new(KubernetesError::RequestFailed {
                target: format!("{kind} {namespace}/*"),
            }));
        }
        Ok(state
            .objects
            .iter()
            .filter(|((object_kind, object_namespace, _), object)| {
                *object_kind == kind
                    && object_namespace == namespace
                    && object.labels.contains_key(label_key)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn delete_object(&self, kind: BackendKind, namespace: &str, name: &str) -> KubeResult<()> {
        let mut state = self.state();
        let target = format!("{kind} {namespace}/{name}");
        if state.failing_deletes.contains(name) {
            return Err(Report::new(KubernetesError::RequestFailed { target }));
        }
        let key = (kind, namespace.to_string(), name.to_string());
        if state.objects.remove(&key).is_none() {
            return Err(not_found(target));
        }
        if kind == BackendKind::Service {
            state
                .services
                .remove(&(namespace.to_string(), name.to_string()));
        }
        state.deleted.push(KubeObjectRef::of(kind, namespace, name));
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> KubeResult<()> {
        let mut state = self.state();
        let (namespace, name) = namespaced_key(service);
        let key = (BackendKind::Service, namespace.clone(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(already_exists(format!("service {namespace}/{name}")));
        }
        state.objects.insert(
            key,
            LabeledObject {
                name: name.clone(),
                namespace: namespace.clone(),
                labels: service.labels().clone(),
            },
        );
        state.services.insert((namespace, name), service.clone());
        Ok(())
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> KubeResult<ServiceAccount> {
        self.state()
            .service_accounts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(format!("serviceaccount {namespace}/{name}")))
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> KubeResult<ServiceAccount> {
        let mut state = self.state();
        let key = namespaced_key(account);
        if state.service_accounts.contains_key(&key) {
            return Err(already_exists(format!("serviceaccount {}/{}", key.0, key.1)));
        }
        state.service_accounts.insert(key, account.clone());
        Ok(account.clone())
    }

    async fn get_cluster_role(&self, name: &str) -> KubeResult<ClusterRole> {
        self.state()
            .cluster_roles
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(format!("clusterrole {name}")))
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> KubeResult<ClusterRole> {
        let mut state = self.state();
        let name = role.name_any();
        if state.cluster_roles.contains_key(&name) {
            return Err(already_exists(format!("clusterrole {name}")));
        }
        state.cluster_roles.insert(name, role.clone());
        Ok(role.clone())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> KubeResult<ClusterRoleBinding> {
        self.state()
            .cluster_role_bindings
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(format!("clusterrolebinding {name}")))
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBinding> {
        let mut state = self.state();
        let name = binding.name_any();
        if state.cluster_role_bindings.contains_key(&name) {
            return Err(already_exists(format!("clusterrolebinding {name}")));
        }
        state.cluster_role_bindings.insert(name, binding.clone());
        Ok(binding.clone())
    }

    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBinding> {
        let mut state = self.state();
        let name = binding.name_any();
        if !state.cluster_role_bindings.contains_key(&name) {
            return Err(not_found(format!("clusterrolebinding {name}")));
        }
        state.cluster_role_bindings.insert(name, binding.clone());
        Ok(binding.clone())
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> KubeResult<RoleBinding> {
        self.state()
            .role_bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(format!("rolebinding {namespace}/{name}")))
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> KubeResult<RoleBinding> {
        let mut state = self.state();
        let key = namespaced_key(binding);
        if state.role_bindings.contains_key(&key) {
            return Err(already_exists(format!("rolebinding {}/{}", key.0, key.1)));
        }
        state.role_bindings.insert(key, binding.clone());
        Ok(binding.clone())
    }

    async fn replace_role_binding(&self, binding: &RoleBinding) -> KubeResult<RoleBinding> {
        let mut state = self.state();
        let key = namespaced_key(binding);
        if !state.role_bindings.contains_key(&key) {
            return Err(not_found(format!("rolebinding {}/{}", key.0, key.1)));
        }
        state.role_bindings.insert(key, binding.clone());
        Ok(binding.clone())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> KubeResult<()> {
        self.state()
            .role_bindings
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(format!("rolebinding {namespace}/{name}")))
    }
}

#[async_trait]
impl DefinitionStore for FakeCluster {
    async fn list_environments(&self) -> KubeResult<Vec<Environment>> {
        let state = self.state();
        if state.fail_environment_list {
            return Err(Report::new(KubernetesError::RequestFailed {
                target: "environment *".to_string(),
            }));
        }
        Ok(state.environments.values().cloned().collect())
    }

    async fn get_function(&self, namespace: &str, name: &str) -> KubeResult<Function> {
        self.state()
            .functions
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(format!("function {namespace}/{name}")))
    }

    async fn list_functions(&self, namespace: &str) -> KubeResult<Vec<Function>> {
        Ok(self
            .state()
            .functions
            .iter()
            .filter(|((function_namespace, _), _)| function_namespace == namespace)
            .map(|(_, function)| function.clone())
            .collect())
    }
}
