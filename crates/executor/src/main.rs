mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use executor::app_builder::ApplicationBuilder;
use executor::cleanup::GenerationCleanup;
use executor::config::CleanupArgs;
use executor::config::Cli;
use executor::config::Commands;
use executor::config::DaemonArgs;
use executor::k8s::kube_client::init_kube_client;
use executor::k8s::KubeCluster;
use executor::naming::new_instance_id;
use executor::signals::setup_stack_trace_handler;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Cleanup(cleanup_args) => run_cleanup(cleanup_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_file.as_deref())?;
    setup_stack_trace_handler()?;

    tracing::info!("Starting executor daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(&daemon_args).build().await?;
    app.run().await
}

/// Removes every labelled backend in the given namespaces. A fresh instance
/// id makes all existing generations stale.
async fn run_cleanup(cleanup_args: CleanupArgs) -> Result<()> {
    let _guard = logging::init(None)?;

    let client = init_kube_client(cleanup_args.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize cluster client: {e:?}"))?;
    let cluster = Arc::new(KubeCluster::new(
        client,
        Duration::from_secs(cleanup_args.api_timeout_secs),
    ));

    let cleanup = GenerationCleanup::new(
        cluster,
        cleanup_args.namespaces,
        new_instance_id(),
        Duration::from_secs(cleanup_args.grace_period_secs),
    );
    let report = cleanup.run(CancellationToken::new()).await;

    tracing::info!(deleted = ?report.deleted, "Cleanup finished");
    if !report.failures.is_empty() {
        anyhow::bail!("{} cleanup steps failed", report.failures.len());
    }
    Ok(())
}
