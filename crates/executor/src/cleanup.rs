//! Removal of backends left behind by earlier executor instances
//!
//! Every backend object carries the id of the executor instance that created
//! it. On startup, objects stamped with any other id belong to a previous
//! generation and are removed: routing and controllers first, then, after a
//! grace period that lets in-flight requests finish, the pods themselves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::k8s::is_not_found;
use crate::k8s::BackendKind;
use crate::k8s::ClusterClient;
use crate::k8s::KubeObjectRef;
use crate::k8s::LabeledObject;
use crate::naming::INSTANCE_ID_LABEL;
use crate::soft_failure::SoftFailure;

/// Kinds removed before the grace period, in order.
const CONTROLLER_KINDS: [BackendKind; 4] = [
    BackendKind::Service,
    BackendKind::HorizontalPodAutoscaler,
    BackendKind::Deployment,
    BackendKind::ReplicaSet,
];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub deleted: BTreeMap<BackendKind, usize>,
    pub failures: Vec<SoftFailure>,
    /// Set when cancellation arrived during the grace period.
    pub pods_skipped: bool,
}

impl CleanupReport {
    pub fn deleted_count(&self, kind: BackendKind) -> usize {
        self.deleted.get(&kind).copied().unwrap_or_default()
    }
}

pub struct GenerationCleanup {
    cluster: Arc<dyn ClusterClient>,
    namespaces: Vec<String>,
    instance_id: String,
    grace_period: Duration,
}

impl GenerationCleanup {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespaces: Vec<String>,
        instance_id: impl Into<String>,
        grace_period: Duration,
    ) -> Self {
        Self {
            cluster,
            namespaces,
            instance_id: instance_id.into(),
            grace_period,
        }
    }

    /// Runs the whole procedure once. Nothing here fails the caller; every
    /// problem ends up in the report.
    #[tracing::instrument(skip(self, cancellation_token), fields(instance_id = %self.instance_id))]
    pub async fn run(&self, cancellation_token: CancellationToken) -> CleanupReport {
        let mut report = CleanupReport::default();
        self.remove_routing_and_controllers(&mut report).await;

        info!(grace_period = ?self.grace_period, "Waiting before removing stale pods");
        select! {
            _ = cancellation_token.cancelled() => {
                info!("Cleanup cancelled, leaving stale pods in place");
                report.pods_skipped = true;
                return report;
            }
            _ = tokio::time::sleep(self.grace_period) => {}
        }

        self.remove_pods(&mut report).await;
        info!(
            deleted = ?report.deleted,
            failures = report.failures.len(),
            "Stale generation cleanup finished"
        );
        report
    }

    pub async fn remove_routing_and_controllers(&self, report: &mut CleanupReport) {
        for kind in CONTROLLER_KINDS {
            self.remove_stale(kind, report).await;
        }
    }

    pub async fn remove_pods(&self, report: &mut CleanupReport) {
        self.remove_stale(BackendKind::Pod, report).await;
    }

    fn is_stale(&self, object: &LabeledObject) -> bool {
        object
            .labels
            .get(INSTANCE_ID_LABEL)
            .is_some_and(|id| *id != self.instance_id)
    }

    async fn remove_stale(&self, kind: BackendKind, report: &mut CleanupReport) {
        for namespace in &self.namespaces {
            let objects = match self
                .cluster
                .list_labeled(kind, namespace, INSTANCE_ID_LABEL)
                .await
            {
                Ok(objects) => objects,
                Err(e) => {
                    report.failures.push(SoftFailure::from_report(
                        "list",
                        format!("{kind} {namespace}/*"),
                        &e,
                    ));
                    continue;
                }
            };

            for object in objects.iter().filter(|object| self.is_stale(object)) {
                let target = KubeObjectRef::of(kind, &object.namespace, &object.name);
                match self
                    .cluster
                    .delete_object(kind, &object.namespace, &object.name)
                    .await
                {
                    Ok(()) => {
                        debug!(object = %target, "Deleted stale object");
                        *report.deleted.entry(kind).or_default() += 1;
                    }
                    Err(e) if is_not_found(&e) => {
                        debug!(object = %target, "Stale object already gone");
                    }
                    Err(e) => {
                        report
                            .failures
                            .push(SoftFailure::from_report("delete", target.to_string(), &e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::k8s::fake::FakeCluster;

    const NS: &str = "fission-function";
    const GRACE: Duration = Duration::from_secs(360);

    fn seeded_cluster() -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        let old = [(INSTANCE_ID_LABEL, "old")];
        let current = [(INSTANCE_ID_LABEL, "current")];
        cluster.insert_object(BackendKind::Pod, NS, "old-pod", &old);
        cluster.insert_object(BackendKind::Pod, NS, "current-pod", &current);
        cluster.insert_object(BackendKind::Pod, NS, "unlabelled-pod", &[("app", "x")]);
        cluster.insert_object(BackendKind::Service, NS, "old-svc", &old);
        cluster.insert_object(BackendKind::Deployment, NS, "old-deploy", &old);
        cluster.insert_object(BackendKind::ReplicaSet, NS, "old-rs", &old);
        cluster.insert_object(BackendKind::HorizontalPodAutoscaler, NS, "old-hpa", &old);
        cluster.insert_object(BackendKind::Deployment, NS, "current-deploy", &current);
        cluster
    }

    fn cleanup(cluster: Arc<FakeCluster>) -> GenerationCleanup {
        GenerationCleanup::new(cluster, vec![NS.to_string()], "current", GRACE)
    }

    #[tokio::test(start_paused = true)]
    async fn pods_are_removed_only_after_grace_period() {
        let cluster = seeded_cluster();
        let cleanup = Arc::new(cleanup(cluster.clone()));

        let handle = {
            let cleanup = cleanup.clone();
            tokio::spawn(async move { cleanup.run(CancellationToken::new()).await })
        };

        tokio::time::sleep(GRACE - Duration::from_secs(1)).await;
        assert!(!cluster.contains_object(BackendKind::Service, NS, "old-svc"));
        assert!(!cluster.contains_object(BackendKind::Deployment, NS, "old-deploy"));
        assert!(cluster.contains_object(BackendKind::Pod, NS, "old-pod"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let report = handle.await.unwrap();
        assert!(!cluster.contains_object(BackendKind::Pod, NS, "old-pod"));
        assert_eq!(report.deleted_count(BackendKind::Pod), 1);
        assert!(report.failures.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_in_dependency_order_and_spares_current_generation() {
        let cluster = seeded_cluster();
        cleanup(cluster.clone()).run(CancellationToken::new()).await;

        let kinds: Vec<String> = cluster
            .deleted()
            .into_iter()
            .map(|object| object.kind)
            .collect();
        assert_eq!(
            kinds,
            vec!["service", "horizontalpodautoscaler", "deployment", "replicaset", "pod"]
        );
        assert!(cluster.contains_object(BackendKind::Pod, NS, "current-pod"));
        assert!(cluster.contains_object(BackendKind::Pod, NS, "unlabelled-pod"));
        assert!(cluster.contains_object(BackendKind::Deployment, NS, "current-deploy"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_soft_and_later_phases_still_run() {
        let cluster = seeded_cluster();
        cluster.fail_list(BackendKind::Service);
        cluster.fail_delete("old-deploy");

        let report = cleanup(cluster.clone()).run(CancellationToken::new()).await;

        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].operation, "list");
        assert_eq!(report.failures[1].operation, "delete");
        assert!(cluster.contains_object(BackendKind::Service, NS, "old-svc"));
        assert!(!cluster.contains_object(BackendKind::ReplicaSet, NS, "old-rs"));
        assert!(!cluster.contains_object(BackendKind::Pod, NS, "old-pod"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_a_no_op() {
        let cluster = seeded_cluster();
        let cleanup = cleanup(cluster.clone());
        cleanup.run(CancellationToken::new()).await;
        let deleted = cluster.deleted().len();

        let report = cleanup.run(CancellationToken::new()).await;
        assert!(report.deleted.is_empty());
        assert!(report.failures.is_empty());
        assert_eq!(cluster.deleted().len(), deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_grace_keeps_pods() {
        let cluster = seeded_cluster();
        let token = CancellationToken::new();
        token.cancel();

        let report = cleanup(cluster.clone()).run(token).await;
        assert!(report.pods_skipped);
        assert!(cluster.contains_object(BackendKind::Pod, NS, "old-pod"));
        assert_eq!(report.deleted_count(BackendKind::Service), 1);
    }
}
