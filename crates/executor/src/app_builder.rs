use std::sync::Arc;

use anyhow::Result;
use kube::Client;

use crate::app::Application;
use crate::cleanup::GenerationCleanup;
use crate::config::DaemonArgs;
use crate::config::ExecutorConfig;
use crate::fscache::FunctionServiceCache;
use crate::k8s::kube_client::init_kube_client;
use crate::k8s::KubeCluster;
use crate::naming::new_instance_id;
use crate::rbac::RbacProvisioner;
use crate::reaper::IdleReaper;
use crate::reconciler::FunctionInformer;
use crate::reconciler::FunctionReconciler;

/// Application builder
pub struct ApplicationBuilder {
    config: ExecutorConfig,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: &DaemonArgs) -> Self {
        Self {
            config: ExecutorConfig::from(daemon_args),
        }
    }

    /// Connects to the cluster, grants the fetcher its access and wires all
    /// components around one shared client.
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let client = init_kube_client(self.config.kubeconfig.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cluster client: {e:?}"))?;
        let cluster = Arc::new(KubeCluster::new(client.clone(), self.config.api_timeout));

        RbacProvisioner::new(cluster.clone())
            .setup_fetcher_access(&self.config.function_namespace)
            .await
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        Ok(self.assemble(client, cluster))
    }

    fn assemble(self, client: Client, cluster: Arc<KubeCluster>) -> Application {
        let instance_id = new_instance_id();
        let cache = Arc::new(FunctionServiceCache::new());

        let cleanup = Arc::new(GenerationCleanup::new(
            cluster.clone(),
            self.config.cleanup_namespaces.clone(),
            instance_id.clone(),
            self.config.cleanup_grace_period,
        ));
        let reaper = Arc::new(IdleReaper::new(
            cache.clone(),
            cluster.clone(),
            cluster.clone(),
            self.config.idle_reap_threshold,
            self.config.reaper_poll_interval,
        ));
        let reconciler = Arc::new(FunctionReconciler::new(
            cluster.clone(),
            cluster,
            self.config.reconciler(),
        ));
        let informer = Arc::new(FunctionInformer::new(
            client,
            reconciler,
            self.config.resync_period,
        ));

        Application {
            config: self.config,
            instance_id,
            cache,
            cleanup,
            reaper,
            informer,
        }
    }
}
