//! Function lifecycle against an in-memory cluster: add, move to another
//! environment namespace, delete.

use std::sync::Arc;
use std::time::Duration;

use api_types::AllowedFunctionsPerContainer;
use api_types::Environment;
use api_types::EnvironmentReference;
use api_types::EnvironmentSpec;
use api_types::ExecutionStrategy;
use api_types::ExecutorType;
use api_types::Function;
use api_types::FunctionSpec;
use api_types::InvokeStrategy;
use executor::fscache::FuncSvc;
use executor::fscache::FunctionIdentity;
use executor::fscache::FunctionServiceCache;
use executor::fscache::ManualClock;
use executor::k8s::fake::FakeCluster;
use executor::k8s::BackendKind;
use executor::k8s::KubeObjectRef;
use executor::naming::FETCHER_SERVICE_ACCOUNT;
use executor::naming::SECRET_CONFIGMAP_GETTER_BINDING;
use executor::reaper::IdleReaper;
use executor::reconciler::FunctionEventHandler;
use executor::reconciler::FunctionReconciler;
use executor::reconciler::ReconcilerConfig;
use similar_asserts::assert_eq;

fn pool_function(name: &str, namespace: &str, env_namespace: &str) -> Function {
    let mut function = Function::new(
        name,
        FunctionSpec {
            environment: EnvironmentReference {
                name: "python".to_string(),
                namespace: env_namespace.to_string(),
            },
            invoke_strategy: InvokeStrategy {
                execution_strategy: ExecutionStrategy {
                    executor_type: ExecutorType::Poolmgr,
                    ..Default::default()
                },
                ..Default::default()
            },
        },
    );
    function.metadata.namespace = Some(namespace.to_string());
    function.metadata.uid = Some(format!("uid-{name}"));
    function
}

fn fetcher_subjects(cluster: &FakeCluster, namespace: &str) -> Vec<(String, String)> {
    cluster
        .role_binding(namespace, SECRET_CONFIGMAP_GETTER_BINDING)
        .map(|binding| {
            binding
                .subjects
                .unwrap_or_default()
                .into_iter()
                .map(|subject| (subject.name, subject.namespace.unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default()
}

fn fetcher(namespace: &str) -> (String, String) {
    (FETCHER_SERVICE_ACCOUNT.to_string(), namespace.to_string())
}

fn reconciler(cluster: &Arc<FakeCluster>) -> FunctionReconciler {
    FunctionReconciler::new(
        cluster.clone(),
        cluster.clone(),
        ReconcilerConfig {
            function_namespace: "fission-function".to_string(),
            istio_enabled: true,
        },
    )
}

#[test_log::test(tokio::test)]
async fn environment_move_then_delete_leaves_no_grants_or_services() {
    let cluster = Arc::new(FakeCluster::new());
    let reconciler = reconciler(&cluster);

    let v1 = pool_function("hello", "ns1", "envNS");
    cluster.insert_function(v1.clone());
    let added = reconciler.on_add(&v1).await;
    assert!(added.is_clean());
    assert_eq!(fetcher_subjects(&cluster, "ns1"), vec![fetcher("envNS")]);

    let v2 = pool_function("hello", "ns1", "envNS2");
    cluster.insert_function(v2.clone());
    let updated = reconciler.on_update(&v1, &v2).await;
    assert!(updated.is_clean());
    assert_eq!(
        fetcher_subjects(&cluster, "ns1"),
        vec![fetcher("envNS"), fetcher("envNS2")]
    );

    assert!(cluster.service("envNS", "istio-hello-ns1").is_none());
    assert!(cluster.service("envNS2", "istio-hello-ns1").is_some());

    // resync replays the add path for the moved function
    assert!(reconciler.on_add(&v2).await.is_clean());
    assert_eq!(cluster.object_count(BackendKind::Service), 1);

    cluster.remove_function("ns1", "hello");
    let deleted = reconciler.on_delete(&v2).await;
    assert!(deleted.is_clean());
    assert_eq!(deleted.subjects_removed, 2);
    assert!(fetcher_subjects(&cluster, "ns1").is_empty());
    assert_eq!(cluster.object_count(BackendKind::Service), 0);
}

#[test_log::test(tokio::test)]
async fn mesh_service_follows_function_and_delete_is_idempotent() {
    let cluster = Arc::new(FakeCluster::new());
    let reconciler = reconciler(&cluster);
    let hello = pool_function("hello", "ns1", "envNS");
    cluster.insert_function(hello.clone());

    reconciler.on_add(&hello).await;
    let service = cluster.service("envNS", "istio-hello-ns1").unwrap();
    assert_eq!(
        service.metadata.labels.unwrap().get("functionName").cloned(),
        Some("hello".to_string())
    );

    cluster.remove_function("ns1", "hello");
    let deleted = reconciler.on_delete(&hello).await;
    assert!(deleted.is_clean());
    assert_eq!(deleted.services_deleted, 1);
    assert!(cluster.service("envNS", "istio-hello-ns1").is_none());
    assert!(cluster.role_binding("ns1", SECRET_CONFIGMAP_GETTER_BINDING).is_none());

    let deleted_again = reconciler.on_delete(&hello).await;
    assert!(deleted_again.is_clean());
    assert_eq!(deleted_again.services_deleted, 0);
}

#[test_log::test(tokio::test)]
async fn repeated_add_creates_one_binding_subject_and_one_service() {
    let cluster = Arc::new(FakeCluster::new());
    let reconciler = reconciler(&cluster);
    let hello = pool_function("hello", "ns1", "envNS");

    for _ in 0..3 {
        assert!(reconciler.on_add(&hello).await.is_clean());
    }

    assert_eq!(fetcher_subjects(&cluster, "ns1"), vec![fetcher("envNS")]);
    assert_eq!(cluster.object_count(BackendKind::Service), 1);
}

#[test_log::test(tokio::test)]
async fn reaper_reclaims_backend_of_deleted_function() {
    let cluster = Arc::new(FakeCluster::new());
    let clock = Arc::new(ManualClock::default());
    let cache = Arc::new(FunctionServiceCache::with_clock(clock.clone()));
    let reaper = IdleReaper::new(
        cache.clone(),
        cluster.clone(),
        cluster.clone(),
        Duration::from_secs(120),
        Duration::from_secs(2),
    );

    let mut environment = Environment::new(
        "python",
        EnvironmentSpec {
            allowed_functions_per_container: AllowedFunctionsPerContainer::Single,
            ..Default::default()
        },
    );
    environment.metadata.namespace = Some("envNS".to_string());
    cluster.insert_environment(environment);

    cluster.insert_object(BackendKind::Pod, "envNS", "python-pool-abc", &[]);
    let backend = FuncSvc::new(
        FunctionIdentity::new("hello", "ns1", "uid-hello"),
        EnvironmentReference {
            name: "python".to_string(),
            namespace: "envNS".to_string(),
        },
        "10.1.2.3:8888",
        vec![KubeObjectRef::of(BackendKind::Pod, "envNS", "python-pool-abc")],
        ExecutorType::Poolmgr,
        cache.now(),
    );
    cache.put(backend.clone()).unwrap();

    // dispatch keeps it alive
    clock.advance(Duration::from_secs(100));
    cache.touch_by_address("10.1.2.3:8888").unwrap();
    clock.advance(Duration::from_secs(100));
    let report = reaper.reap_once().await.unwrap();
    assert!(report.reaped.is_empty());

    clock.advance(Duration::from_secs(30));
    let report = reaper.reap_once().await.unwrap();
    assert_eq!(report.reaped, vec![backend.function]);
    assert!(!cluster.contains_object(BackendKind::Pod, "envNS", "python-pool-abc"));
    assert!(cache.is_empty());
}
