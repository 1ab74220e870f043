use std::collections::BTreeSet;
use std::sync::Arc;

use api_types::ExecutorType;
use api_types::Function;
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;
use tracing::info;

use super::mesh::build_mesh_service;
use crate::k8s::is_already_exists;
use crate::k8s::is_not_found;
use crate::k8s::BackendKind;
use crate::k8s::ClusterClient;
use crate::k8s::DefinitionStore;
use crate::k8s::KubeObjectRef;
use crate::naming::environment_namespace;
use crate::naming::mesh_service_name;
use crate::naming::FETCHER_SERVICE_ACCOUNT;
use crate::naming::SECRET_CONFIGMAP_GETTER_BINDING;
use crate::naming::SECRET_CONFIGMAP_GETTER_ROLE;
use crate::rbac::RbacProvisioner;
use crate::rbac::SubjectPruning;
use crate::rbac::CLUSTER_ROLE_KIND;
use crate::soft_failure::SoftFailure;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub function_namespace: String,
    pub istio_enabled: bool,
}

/// Side effects of handling one event.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub role_bindings_ensured: usize,
    pub subjects_removed: usize,
    pub services_created: usize,
    pub services_deleted: usize,
    pub failures: Vec<SoftFailure>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Receives function definition changes. The per-event methods all funnel
/// into [`reconcile`](FunctionEventHandler::reconcile) unless overridden.
#[async_trait]
pub trait FunctionEventHandler: Send + Sync {
    /// `old` is the last state seen, `new` the current one; `None` on the
    /// side where the function does not exist.
    async fn reconcile(&self, old: Option<&Function>, new: Option<&Function>) -> ReconcileReport;

    async fn on_add(&self, function: &Function) -> ReconcileReport {
        self.reconcile(None, Some(function)).await
    }

    async fn on_update(&self, old: &Function, new: &Function) -> ReconcileReport {
        self.reconcile(Some(old), Some(new)).await
    }

    async fn on_delete(&self, function: &Function) -> ReconcileReport {
        self.reconcile(Some(function), None).await
    }
}

pub struct FunctionReconciler {
    cluster: Arc<dyn ClusterClient>,
    definitions: Arc<dyn DefinitionStore>,
    rbac: RbacProvisioner,
    config: ReconcilerConfig,
}

fn is_pool_shared(function: &Function) -> bool {
    function.spec.executor_type() == ExecutorType::Poolmgr
}

fn same_incarnation(a: &Function, b: &Function) -> bool {
    a.name_any() == b.name_any() && a.uid() == b.uid()
}

impl FunctionReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        definitions: Arc<dyn DefinitionStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            rbac: RbacProvisioner::new(cluster.clone()),
            cluster,
            definitions,
            config,
        }
    }

    fn env_namespace(&self, function: &Function) -> String {
        environment_namespace(
            &function.spec.environment.namespace,
            &self.config.function_namespace,
        )
    }

    /// Lets the fetcher running in the function's environment namespace
    /// read secrets and config maps of the function's namespace.
    async fn grant_fetcher(&self, function: &Function, report: &mut ReconcileReport) {
        let namespace = function.namespace().unwrap_or_default();
        let env_namespace = self.env_namespace(function);
        match self
            .rbac
            .ensure_role_binding(
                &namespace,
                SECRET_CONFIGMAP_GETTER_BINDING,
                CLUSTER_ROLE_KIND,
                SECRET_CONFIGMAP_GETTER_ROLE,
                FETCHER_SERVICE_ACCOUNT,
                &env_namespace,
            )
            .await
        {
            Ok(_) => {
                info!(
                    function = %function.name_any(),
                    namespace = %namespace,
                    fetcher_namespace = %env_namespace,
                    "Set up role binding for fetcher"
                );
                report.role_bindings_ensured += 1;
            }
            Err(e) => report.failures.push(SoftFailure::from_report(
                "ensure",
                format!("rolebinding {namespace}/{SECRET_CONFIGMAP_GETTER_BINDING}"),
                &e,
            )),
        }
    }

    async fn create_mesh_service(&self, function: &Function, report: &mut ReconcileReport) {
        let service = build_mesh_service(function, &self.env_namespace(function));
        let target = KubeObjectRef::new(
            "service",
            service.metadata.namespace.clone().unwrap_or_default(),
            service.metadata.name.clone().unwrap_or_default(),
        );
        match self.cluster.create_service(&service).await {
            Ok(()) => report.services_created += 1,
            Err(e) if is_already_exists(&e) => {
                debug!(service = %target, "Mesh service already exists");
            }
            Err(e) => report
                .failures
                .push(SoftFailure::from_report("create", target.to_string(), &e)),
        }
    }

    /// Removes the mesh service of `function` from the environment namespace
    /// that `function` resolves to.
    async fn delete_mesh_service(&self, function: &Function, report: &mut ReconcileReport) {
        let env_namespace = self.env_namespace(function);
        let name = mesh_service_name(
            &function.name_any(),
            &function.namespace().unwrap_or_default(),
        );
        match self
            .cluster
            .delete_object(BackendKind::Service, &env_namespace, &name)
            .await
        {
            Ok(()) => report.services_deleted += 1,
            Err(e) if is_not_found(&e) => {
                debug!(service = %name, namespace = %env_namespace, "Mesh service already gone");
            }
            Err(e) => report.failures.push(SoftFailure::from_report(
                "delete",
                KubeObjectRef::of(BackendKind::Service, &env_namespace, &name).to_string(),
                &e,
            )),
        }
    }

    async fn handle_add(&self, function: &Function, report: &mut ReconcileReport) {
        // dedicated deployments are specialized at pod start and need neither
        if !is_pool_shared(function) {
            debug!(function = %function.name_any(), "Ignoring function outside the pool");
            return;
        }

        self.grant_fetcher(function, report).await;

        if self.config.istio_enabled {
            self.create_mesh_service(function, report).await;
        }
    }

    /// Follows a move to another environment namespace. The fetcher grant
    /// for the old namespace stays until the delete path prunes it; the mesh
    /// service moves with the pool pods it selects.
    async fn handle_update(&self, old: &Function, new: &Function, report: &mut ReconcileReport) {
        let from = self.env_namespace(old);
        let to = self.env_namespace(new);
        if from == to {
            return;
        }
        info!(
            function = %new.name_any(),
            from = %from,
            to = %to,
            "Environment namespace changed"
        );

        if self.config.istio_enabled {
            self.delete_mesh_service(old, report).await;
        }
        if is_pool_shared(new) {
            self.grant_fetcher(new, report).await;
            if self.config.istio_enabled {
                self.create_mesh_service(new, report).await;
            }
        }
    }

    async fn handle_delete(&self, function: &Function, report: &mut ReconcileReport) {
        if self.config.istio_enabled {
            self.delete_mesh_service(function, report).await;
        }

        if is_pool_shared(function) {
            self.release_fetcher(function, report).await;
        }
    }

    /// Drops every fetcher subject of the function's namespace that no
    /// remaining pool function resolves to, including grants left behind
    /// by earlier environment moves.
    async fn release_fetcher(&self, function: &Function, report: &mut ReconcileReport) {
        let namespace = function.namespace().unwrap_or_default();
        let siblings = match self.definitions.list_functions(&namespace).await {
            Ok(functions) => functions,
            Err(e) => {
                report.failures.push(SoftFailure::from_report(
                    "list",
                    format!("function {namespace}/*"),
                    &e,
                ));
                return;
            }
        };
        let needed: BTreeSet<String> = siblings
            .iter()
            .filter(|other| !same_incarnation(other, function) && is_pool_shared(other))
            .map(|other| self.env_namespace(other))
            .collect();

        match self
            .rbac
            .prune_role_binding_subjects(
                &namespace,
                SECRET_CONFIGMAP_GETTER_BINDING,
                FETCHER_SERVICE_ACCOUNT,
                &needed,
            )
            .await
        {
            Ok(SubjectPruning { removed: 0, .. }) => {
                debug!(
                    namespace = %namespace,
                    still_needed = ?needed,
                    "Fetcher access still used by other functions"
                );
            }
            Ok(pruning) => {
                info!(
                    namespace = %namespace,
                    removed = pruning.removed,
                    binding_deleted = pruning.binding_deleted,
                    "Revoked fetcher access"
                );
                report.subjects_removed += pruning.removed;
            }
            Err(e) => report.failures.push(SoftFailure::from_report(
                "update",
                format!("rolebinding {namespace}/{SECRET_CONFIGMAP_GETTER_BINDING}"),
                &e,
            )),
        }
    }
}

#[async_trait]
impl FunctionEventHandler for FunctionReconciler {
    async fn reconcile(&self, old: Option<&Function>, new: Option<&Function>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        match (old, new) {
            (None, Some(function)) => self.handle_add(function, &mut report).await,
            (Some(old), Some(new)) => self.handle_update(old, new, &mut report).await,
            (Some(function), None) => self.handle_delete(function, &mut report).await,
            (None, None) => {}
        }
        report
    }
}
