use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::k8s::types::KubernetesError;

fn connection_failed(message: impl Into<String>) -> KubernetesError {
    KubernetesError::ConnectionFailed {
        message: message.into(),
    }
}

/// Resolves the client configuration. Without an explicit file the usual
/// chain applies: in-cluster service account first, then `~/.kube/config`.
async fn load_config(kubeconfig: Option<&Path>) -> Result<Config, Report<KubernetesError>> {
    let Some(path) = kubeconfig else {
        return Config::infer()
            .await
            .change_context_lazy(|| connection_failed("No usable cluster configuration found"));
    };

    let file = Kubeconfig::read_from(path).change_context_lazy(|| {
        connection_failed(format!("Failed to read kubeconfig {}", path.display()))
    })?;
    Config::from_custom_kubeconfig(file, &KubeConfigOptions::default())
        .await
        .change_context_lazy(|| {
            connection_failed(format!("Invalid kubeconfig {}", path.display()))
        })
}

/// Builds the shared cluster client used by every executor component.
pub async fn init_kube_client(
    kubeconfig: Option<&Path>,
) -> Result<Client, Report<KubernetesError>> {
    let config = load_config(kubeconfig).await?;
    tracing::debug!(cluster_url = %config.cluster_url, "Connecting to cluster");
    Client::try_from(config)
        .change_context_lazy(|| connection_failed("Failed to build cluster client"))
}
