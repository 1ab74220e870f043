pub mod cleanup;
pub mod cli;
pub mod daemon;

use std::path::PathBuf;
use std::time::Duration;

use crate::reconciler::ReconcilerConfig;

/// Runtime settings of the daemon, resolved from its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub kubeconfig: Option<PathBuf>,
    pub function_namespace: String,
    pub cleanup_namespaces: Vec<String>,
    pub idle_reap_threshold: Duration,
    pub reaper_poll_interval: Duration,
    pub cleanup_grace_period: Duration,
    pub resync_period: Duration,
    pub api_timeout: Duration,
    pub istio_enabled: bool,
}

impl ExecutorConfig {
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            function_namespace: self.function_namespace.clone(),
            istio_enabled: self.istio_enabled,
        }
    }
}

impl From<&daemon::DaemonArgs> for ExecutorConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        let cleanup_namespaces: Vec<String> = args
            .cleanup_namespaces
            .iter()
            .map(|namespace| namespace.trim().to_string())
            .filter(|namespace| !namespace.is_empty())
            .collect();
        Self {
            kubeconfig: args.kubeconfig.clone(),
            function_namespace: args.function_namespace.clone(),
            cleanup_namespaces: if cleanup_namespaces.is_empty() {
                vec![args.function_namespace.clone()]
            } else {
                cleanup_namespaces
            },
            idle_reap_threshold: Duration::from_secs(args.idle_reap_threshold_secs),
            // a zero interval would spin
            reaper_poll_interval: Duration::from_secs(args.reaper_poll_interval_secs.max(1)),
            cleanup_grace_period: Duration::from_secs(args.cleanup_grace_period_secs),
            resync_period: Duration::from_secs(args.resync_period_secs.max(1)),
            api_timeout: Duration::from_secs(args.api_timeout_secs.max(1)),
            istio_enabled: args.enable_istio,
        }
    }
}

pub use cleanup::*;
pub use cli::*;
pub use daemon::*;
