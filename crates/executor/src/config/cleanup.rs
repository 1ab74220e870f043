use std::path::PathBuf;

use clap::Parser;

use crate::naming::DEFAULT_FUNCTION_NAMESPACE;

#[derive(Parser, Clone, Debug)]
pub struct CleanupArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "FISSION_CLEANUP_NAMESPACES",
        value_delimiter = ',',
        default_value = DEFAULT_FUNCTION_NAMESPACE,
        help = "Namespaces to scan for executor backends"
    )]
    pub namespaces: Vec<String>,

    #[arg(
        long,
        default_value_t = 0,
        help = "Seconds to wait before removing pods"
    )]
    pub grace_period_secs: u64,

    #[arg(long, env = "API_TIMEOUT_SECS", default_value_t = 30)]
    pub api_timeout_secs: u64,
}
