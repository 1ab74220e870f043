use std::path::PathBuf;

use clap::Parser;

use crate::naming::DEFAULT_FUNCTION_NAMESPACE;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "FISSION_FUNCTION_NAMESPACE",
        default_value = DEFAULT_FUNCTION_NAMESPACE,
        help = "Namespace where pool pods and function backends run"
    )]
    pub function_namespace: String,

    #[arg(
        long,
        env = "FISSION_CLEANUP_NAMESPACES",
        value_delimiter = ',',
        help = "Namespaces scanned for stale backends on startup (defaults to the function namespace)"
    )]
    pub cleanup_namespaces: Vec<String>,

    #[arg(
        long,
        env = "IDLE_REAP_THRESHOLD_SECS",
        default_value_t = 120,
        help = "Seconds without a request after which a backend is reclaimed"
    )]
    pub idle_reap_threshold_secs: u64,

    #[arg(
        long,
        env = "REAPER_POLL_INTERVAL_SECS",
        default_value_t = 2,
        help = "Seconds between idle reaper passes"
    )]
    pub reaper_poll_interval_secs: u64,

    #[arg(
        long,
        env = "CLEANUP_GRACE_PERIOD_SECS",
        default_value_t = 360,
        help = "Seconds between removing stale controllers and removing stale pods; covers the longest function run plus router cache expiry"
    )]
    pub cleanup_grace_period_secs: u64,

    #[arg(
        long,
        env = "RESYNC_PERIOD_SECS",
        default_value_t = 30,
        help = "Seconds between full replays of known function definitions"
    )]
    pub resync_period_secs: u64,

    #[arg(
        long,
        env = "API_TIMEOUT_SECS",
        default_value_t = 30,
        help = "Upper bound in seconds for a single cluster API call"
    )]
    pub api_timeout_secs: u64,

    #[arg(
        long,
        env = "ENABLE_ISTIO",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Create a mesh routing service for every pool function"
    )]
    pub enable_istio: bool,

    #[arg(
        long,
        env = "EXECUTOR_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,
}
