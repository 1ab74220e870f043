//! Get-or-create helpers for access-control objects
//!
//! Bindings are shared between many functions, so they are only ever
//! extended with a missing subject or narrowed by one subject; they are never
//! overwritten wholesale.

use std::collections::BTreeSet;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::api::rbac::v1::RoleRef;
use k8s_openapi::api::rbac::v1::Subject;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;
use tracing::info;

use crate::error::ExecutorError;
use crate::k8s::is_already_exists;
use crate::k8s::is_not_found;
use crate::k8s::ClusterClient;
use crate::k8s::KubeResult;
use crate::k8s::KubernetesError;
use crate::naming::FETCHER_SERVICE_ACCOUNT;
use crate::naming::PACKAGE_GETTER_BINDING;
use crate::naming::PACKAGE_GETTER_ROLE;
use crate::naming::SECRET_CONFIGMAP_GETTER_ROLE;

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
pub const CLUSTER_ROLE_KIND: &str = "ClusterRole";
pub const ROLE_KIND: &str = "Role";
/// A create that lost a race falls back to updating the winner's object once.
const WRITE_ATTEMPTS: usize = 2;

/// Outcome of removing a subject from a role binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectRemoval {
    /// The binding does not exist or never listed the subject.
    NotPresent,
    Removed,
    /// The subject was the last one and the binding was deleted.
    BindingDeleted,
}

/// Outcome of narrowing a role binding to the subjects still needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubjectPruning {
    pub removed: usize,
    pub binding_deleted: bool,
}

pub fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

fn is_subject(subject: &Subject, name: &str, namespace: &str) -> bool {
    subject.kind == "ServiceAccount"
        && subject.name == name
        && subject.namespace.as_deref() == Some(namespace)
}

fn has_subject(subjects: Option<&Vec<Subject>>, name: &str, namespace: &str) -> bool {
    subjects.is_some_and(|subjects| {
        subjects
            .iter()
            .any(|subject| is_subject(subject, name, namespace))
    })
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// `roleRef` is immutable, so a binding pointing at another role cannot be
/// repaired by adding subjects.
fn check_role_ref(target: String, found: &RoleRef, expected: &RoleRef) -> KubeResult<()> {
    if found.kind == expected.kind && found.name == expected.name {
        return Ok(());
    }
    Err(Report::new(KubernetesError::RoleRefMismatch {
        target,
        expected: format!("{} {}", expected.kind, expected.name),
        found: format!("{} {}", found.kind, found.name),
    }))
}

fn read_rule(api_group: &str, resources: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: ["get", "list", "watch"].map(String::from).to_vec(),
        ..Default::default()
    }
}

/// Cluster roles the fetcher needs, by name.
pub fn fetcher_cluster_roles() -> Vec<ClusterRole> {
    [
        (
            SECRET_CONFIGMAP_GETTER_ROLE,
            read_rule("", &["secrets", "configmaps"]),
        ),
        (
            PACKAGE_GETTER_ROLE,
            read_rule("fission.io", &["packages"]),
        ),
    ]
    .into_iter()
    .map(|(name, rule)| ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        rules: Some(vec![rule]),
        ..Default::default()
    })
    .collect()
}

pub fn build_role_binding(
    namespace: &str,
    name: &str,
    role_kind: &str,
    role: &str,
    service_account: &str,
    service_account_namespace: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: role_ref(role_kind, role),
        subjects: Some(vec![service_account_subject(
            service_account,
            service_account_namespace,
        )]),
    }
}

pub fn build_cluster_role_binding(
    name: &str,
    cluster_role: &str,
    service_account: &str,
    service_account_namespace: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        role_ref: role_ref(CLUSTER_ROLE_KIND, cluster_role),
        subjects: Some(vec![service_account_subject(
            service_account,
            service_account_namespace,
        )]),
    }
}

fn is_write_race(report: &Report<KubernetesError>) -> bool {
    is_already_exists(report) || matches!(report.current_context(), KubernetesError::Conflict { .. })
}

#[derive(Clone)]
pub struct RbacProvisioner {
    cluster: Arc<dyn ClusterClient>,
}

impl RbacProvisioner {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    pub async fn ensure_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> KubeResult<ServiceAccount> {
        match self.cluster.get_service_account(namespace, name).await {
            Ok(account) => Ok(account),
            Err(e) if is_not_found(&e) => {
                let account = ServiceAccount {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match self.cluster.create_service_account(&account).await {
                    Err(e) if is_already_exists(&e) => Ok(account),
                    result => result,
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ensure_cluster_role(&self, role: &ClusterRole) -> KubeResult<ClusterRole> {
        let name = role.metadata.name.as_deref().unwrap_or_default();
        match self.cluster.get_cluster_role(name).await {
            Ok(existing) => Ok(existing),
            Err(e) if is_not_found(&e) => match self.cluster.create_cluster_role(role).await {
                Err(e) if is_already_exists(&e) => Ok(role.clone()),
                result => result,
            },
            Err(e) => Err(e),
        }
    }

    /// Makes sure the cluster role binding exists and lists the service
    /// account.
    pub async fn ensure_cluster_role_binding(
        &self,
        name: &str,
        cluster_role: &str,
        service_account: &str,
        service_account_namespace: &str,
    ) -> KubeResult<ClusterRoleBinding> {
        let mut attempt = 1;
        loop {
            let result = match self.cluster.get_cluster_role_binding(name).await {
                Ok(mut binding) => {
                    check_role_ref(
                        format!("clusterrolebinding {name}"),
                        &binding.role_ref,
                        &role_ref(CLUSTER_ROLE_KIND, cluster_role),
                    )?;
                    if has_subject(binding.subjects.as_ref(), service_account, service_account_namespace) {
                        return Ok(binding);
                    }
                    binding
                        .subjects
                        .get_or_insert_with(Vec::new)
                        .push(service_account_subject(service_account, service_account_namespace));
                    self.cluster.replace_cluster_role_binding(&binding).await
                }
                Err(e) if is_not_found(&e) => {
                    let binding = build_cluster_role_binding(
                        name,
                        cluster_role,
                        service_account,
                        service_account_namespace,
                    );
                    self.cluster.create_cluster_role_binding(&binding).await
                }
                Err(e) => return Err(e),
            };
            match result {
                Err(e) if is_write_race(&e) && attempt < WRITE_ATTEMPTS => attempt += 1,
                result => return result,
            }
        }
    }

    /// Makes sure the role binding `name` in `namespace` exists, refers to
    /// the role `role_kind`/`role` and lists the service account. Existing
    /// subjects are kept. A binding that refers to a different role fails
    /// with [`KubernetesError::RoleRefMismatch`].
    pub async fn ensure_role_binding(
        &self,
        namespace: &str,
        name: &str,
        role_kind: &str,
        role: &str,
        service_account: &str,
        service_account_namespace: &str,
    ) -> KubeResult<RoleBinding> {
        let expected_ref = role_ref(role_kind, role);
        let mut attempt = 1;
        loop {
            let result = match self.cluster.get_role_binding(namespace, name).await {
                Ok(mut binding) => {
                    check_role_ref(
                        format!("rolebinding {namespace}/{name}"),
                        &binding.role_ref,
                        &expected_ref,
                    )?;
                    if has_subject(binding.subjects.as_ref(), service_account, service_account_namespace) {
                        debug!(namespace, name, service_account_namespace, "Role binding already grants access");
                        return Ok(binding);
                    }
                    binding
                        .subjects
                        .get_or_insert_with(Vec::new)
                        .push(service_account_subject(service_account, service_account_namespace));
                    self.cluster.replace_role_binding(&binding).await
                }
                Err(e) if is_not_found(&e) => {
                    let binding = build_role_binding(
                        namespace,
                        name,
                        role_kind,
                        role,
                        service_account,
                        service_account_namespace,
                    );
                    self.cluster.create_role_binding(&binding).await
                }
                Err(e) => return Err(e),
            };
            match result {
                Err(e) if is_write_race(&e) && attempt < WRITE_ATTEMPTS => attempt += 1,
                result => return result,
            }
        }
    }

    /// Drops one subject from a role binding, deleting the binding when no
    /// subjects remain.
    pub async fn remove_role_binding_subject(
        &self,
        namespace: &str,
        name: &str,
        service_account: &str,
        service_account_namespace: &str,
    ) -> KubeResult<SubjectRemoval> {
        let pruning = self
            .retain_subjects(namespace, name, |subject| {
                !is_subject(subject, service_account, service_account_namespace)
            })
            .await?;
        Ok(match pruning {
            SubjectPruning { removed: 0, .. } => SubjectRemoval::NotPresent,
            SubjectPruning {
                binding_deleted: true,
                ..
            } => SubjectRemoval::BindingDeleted,
            SubjectPruning { .. } => SubjectRemoval::Removed,
        })
    }

    /// Keeps only the subjects of `service_account` whose namespace is in
    /// `needed_namespaces`. Subjects of other accounts are left alone.
    pub async fn prune_role_binding_subjects(
        &self,
        namespace: &str,
        name: &str,
        service_account: &str,
        needed_namespaces: &BTreeSet<String>,
    ) -> KubeResult<SubjectPruning> {
        self.retain_subjects(namespace, name, |subject| {
            subject.kind != "ServiceAccount"
                || subject.name != service_account
                || subject
                    .namespace
                    .as_ref()
                    .is_some_and(|ns| needed_namespaces.contains(ns))
        })
        .await
    }

    async fn retain_subjects(
        &self,
        namespace: &str,
        name: &str,
        keep: impl Fn(&Subject) -> bool + Send,
    ) -> KubeResult<SubjectPruning> {
        let mut binding = match self.cluster.get_role_binding(namespace, name).await {
            Ok(binding) => binding,
            Err(e) if is_not_found(&e) => return Ok(SubjectPruning::default()),
            Err(e) => return Err(e),
        };

        let subjects = binding.subjects.get_or_insert_with(Vec::new);
        let before = subjects.len();
        subjects.retain(|subject| keep(subject));
        let removed = before - subjects.len();
        if removed == 0 {
            return Ok(SubjectPruning::default());
        }

        if subjects.is_empty() {
            return match self.cluster.delete_role_binding(namespace, name).await {
                Ok(()) => Ok(SubjectPruning {
                    removed,
                    binding_deleted: true,
                }),
                Err(e) if is_not_found(&e) => Ok(SubjectPruning {
                    removed,
                    binding_deleted: true,
                }),
                Err(e) => Err(e),
            };
        }
        self.cluster.replace_role_binding(&binding).await?;
        Ok(SubjectPruning {
            removed,
            binding_deleted: false,
        })
    }

    /// Grants the fetcher of `function_namespace` read access to packages and
    /// prepares the cluster roles function namespaces bind to.
    #[tracing::instrument(skip(self))]
    pub async fn setup_fetcher_access(
        &self,
        function_namespace: &str,
    ) -> Result<(), Report<ExecutorError>> {
        let context = || ExecutorError::FetcherAccess {
            namespace: function_namespace.to_string(),
        };

        self.ensure_service_account(function_namespace, FETCHER_SERVICE_ACCOUNT)
            .await
            .change_context_lazy(context)?;
        for role in fetcher_cluster_roles() {
            self.ensure_cluster_role(&role)
                .await
                .change_context_lazy(context)?;
        }
        self.ensure_cluster_role_binding(
            PACKAGE_GETTER_BINDING,
            PACKAGE_GETTER_ROLE,
            FETCHER_SERVICE_ACCOUNT,
            function_namespace,
        )
        .await
        .change_context_lazy(context)?;

        info!("Fetcher access set up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::k8s::fake::FakeCluster;
    use crate::naming::SECRET_CONFIGMAP_GETTER_BINDING;

    fn provisioner() -> (Arc<FakeCluster>, RbacProvisioner) {
        let cluster = Arc::new(FakeCluster::new());
        (cluster.clone(), RbacProvisioner::new(cluster))
    }

    fn subjects(binding: &RoleBinding) -> Vec<(String, String)> {
        binding
            .subjects
            .iter()
            .flatten()
            .map(|s| (s.name.clone(), s.namespace.clone().unwrap_or_default()))
            .collect()
    }

    async fn ensure(rbac: &RbacProvisioner, env_namespace: &str) -> RoleBinding {
        rbac.ensure_role_binding(
            "ns1",
            SECRET_CONFIGMAP_GETTER_BINDING,
            CLUSTER_ROLE_KIND,
            SECRET_CONFIGMAP_GETTER_ROLE,
            FETCHER_SERVICE_ACCOUNT,
            env_namespace,
        )
        .await
        .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn ensure_role_binding_creates_then_extends() {
        let (cluster, rbac) = provisioner();

        ensure(&rbac, "env-a").await;
        ensure(&rbac, "env-a").await;
        ensure(&rbac, "env-b").await;

        let binding = cluster
            .role_binding("ns1", SECRET_CONFIGMAP_GETTER_BINDING)
            .unwrap();
        assert_eq!(binding.role_ref.name, SECRET_CONFIGMAP_GETTER_ROLE);
        assert_eq!(
            subjects(&binding),
            vec![
                (FETCHER_SERVICE_ACCOUNT.to_string(), "env-a".to_string()),
                (FETCHER_SERVICE_ACCOUNT.to_string(), "env-b".to_string()),
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn remove_subject_deletes_emptied_binding() {
        let (cluster, rbac) = provisioner();
        ensure(&rbac, "env-a").await;
        ensure(&rbac, "env-b").await;

        let remove = |env: &'static str| {
            let rbac = rbac.clone();
            async move {
                rbac.remove_role_binding_subject(
                    "ns1",
                    SECRET_CONFIGMAP_GETTER_BINDING,
                    FETCHER_SERVICE_ACCOUNT,
                    env,
                )
                .await
                .unwrap()
            }
        };

        assert_eq!(remove("env-a").await, SubjectRemoval::Removed);
        assert_eq!(remove("env-a").await, SubjectRemoval::NotPresent);
        assert_eq!(remove("env-b").await, SubjectRemoval::BindingDeleted);
        assert!(cluster
            .role_binding("ns1", SECRET_CONFIGMAP_GETTER_BINDING)
            .is_none());
        assert_eq!(remove("env-b").await, SubjectRemoval::NotPresent);
    }

    #[test_log::test(tokio::test)]
    async fn ensure_role_binding_rejects_binding_to_another_role() {
        let (cluster, rbac) = provisioner();
        rbac.ensure_role_binding(
            "ns1",
            SECRET_CONFIGMAP_GETTER_BINDING,
            ROLE_KIND,
            "local-reader",
            FETCHER_SERVICE_ACCOUNT,
            "env-a",
        )
        .await
        .unwrap();

        let err = rbac
            .ensure_role_binding(
                "ns1",
                SECRET_CONFIGMAP_GETTER_BINDING,
                CLUSTER_ROLE_KIND,
                SECRET_CONFIGMAP_GETTER_ROLE,
                FETCHER_SERVICE_ACCOUNT,
                "env-b",
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            KubernetesError::RoleRefMismatch { .. }
        ));
        let binding = cluster
            .role_binding("ns1", SECRET_CONFIGMAP_GETTER_BINDING)
            .unwrap();
        assert_eq!(
            subjects(&binding),
            vec![(FETCHER_SERVICE_ACCOUNT.to_string(), "env-a".to_string())]
        );
    }

    #[test_log::test(tokio::test)]
    async fn prune_keeps_needed_and_foreign_subjects() {
        let (cluster, rbac) = provisioner();
        ensure(&rbac, "env-a").await;
        ensure(&rbac, "env-b").await;
        ensure(&rbac, "env-c").await;
        rbac.ensure_role_binding(
            "ns1",
            SECRET_CONFIGMAP_GETTER_BINDING,
            CLUSTER_ROLE_KIND,
            SECRET_CONFIGMAP_GETTER_ROLE,
            "builder",
            "env-a",
        )
        .await
        .unwrap();

        let needed = BTreeSet::from(["env-b".to_string()]);
        let pruning = rbac
            .prune_role_binding_subjects(
                "ns1",
                SECRET_CONFIGMAP_GETTER_BINDING,
                FETCHER_SERVICE_ACCOUNT,
                &needed,
            )
            .await
            .unwrap();

        assert_eq!(
            pruning,
            SubjectPruning {
                removed: 2,
                binding_deleted: false
            }
        );
        let binding = cluster
            .role_binding("ns1", SECRET_CONFIGMAP_GETTER_BINDING)
            .unwrap();
        assert_eq!(
            subjects(&binding),
            vec![
                (FETCHER_SERVICE_ACCOUNT.to_string(), "env-b".to_string()),
                ("builder".to_string(), "env-a".to_string()),
            ]
        );

        let pruning = rbac
            .prune_role_binding_subjects(
                "ns1",
                SECRET_CONFIGMAP_GETTER_BINDING,
                "builder",
                &BTreeSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(pruning.removed, 1);
        assert!(!pruning.binding_deleted);
    }

    #[test_log::test(tokio::test)]
    async fn setup_fetcher_access_is_idempotent() {
        let (cluster, rbac) = provisioner();

        rbac.setup_fetcher_access("fission-function").await.unwrap();
        rbac.setup_fetcher_access("fission-function").await.unwrap();

        assert!(cluster
            .service_account("fission-function", FETCHER_SERVICE_ACCOUNT)
            .is_some());
        let secrets = cluster.cluster_role(SECRET_CONFIGMAP_GETTER_ROLE).unwrap();
        let rules = secrets.rules.unwrap();
        assert_eq!(
            rules[0].resources.clone().unwrap(),
            vec!["secrets".to_string(), "configmaps".to_string()]
        );
        assert!(cluster.cluster_role(PACKAGE_GETTER_ROLE).is_some());

        let binding = cluster.cluster_role_binding(PACKAGE_GETTER_BINDING).unwrap();
        assert_eq!(binding.subjects.map(|s| s.len()), Some(1));
    }
}
