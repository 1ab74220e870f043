use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cleanup::GenerationCleanup;
use crate::config::ExecutorConfig;
use crate::fscache::FunctionServiceCache;
use crate::reaper::IdleReaper;
use crate::reconciler::FunctionInformer;

/// Application core structure, managing all components
pub struct Application {
    pub config: ExecutorConfig,
    pub instance_id: String,
    /// Shared with the pool provisioner; the reaper evicts from it.
    pub cache: Arc<FunctionServiceCache>,
    pub cleanup: Arc<GenerationCleanup>,
    pub reaper: Arc<IdleReaper>,
    pub informer: Arc<FunctionInformer>,
}

impl Application {
    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!(instance_id = %self.instance_id, "Starting all application tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);
        tracing::info!("All application tasks started successfully");

        let result = tasks.wait_for_completion().await;
        if let Err(e) = &result {
            tracing::error!("Error during task execution: {e:?}");
        }

        tracing::info!(cached_backends = self.cache.len(), "Application run completed");
        result
    }
}

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    /// Long-running tasks; the first one to finish stops the application.
    supervised: Vec<JoinHandle<Result<()>>>,
    /// One-shot work that may finish at any time.
    detached: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            supervised: Vec::new(),
            detached: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn spawn_all_tasks(&mut self, app: &Application) {
        // stale generation cleanup
        let cleanup_task = {
            let cleanup = app.cleanup.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting stale generation cleanup task");
                let report = cleanup.run(token).await;
                tracing::info!(
                    deleted = ?report.deleted,
                    failures = report.failures.len(),
                    "Stale generation cleanup task completed"
                );
            })
        };
        self.detached.push(cleanup_task);

        let reaper_task = {
            let reaper = app.reaper.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting idle reaper task");
                reaper
                    .run(token)
                    .await
                    .map_err(|e| anyhow::anyhow!("Idle reaper failed: {e:?}"))?;
                tracing::info!("Idle reaper task completed");
                Ok(())
            })
        };
        self.supervised.push(reaper_task);

        let informer_task = {
            let informer = app.informer.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting function informer task");
                informer
                    .run(token)
                    .await
                    .map_err(|e| anyhow::anyhow!("Function informer failed: {e:?}"))?;
                tracing::info!("Function informer task completed");
                Ok(())
            })
        };
        self.supervised.push(informer_task);
    }

    /// wait for a supervised task to finish or for Ctrl+C, then cancel
    /// everything and wait for it to wind down
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let mut supervised = std::mem::take(&mut self.supervised);
        let mut outcome = Ok(());

        let finished = tokio::select! {
            (result, index, _) = futures::future::select_all(supervised.iter_mut()) => {
                tracing::error!("A task completed unexpectedly");
                outcome = match result {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("Task panicked or was aborted: {e}")),
                };
                Some(index)
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
                None
            }
        };
        if let Some(index) = finished {
            supervised.remove(index);
        }

        tracing::info!("Cancelling all tasks...");
        self.cancellation_token.cancel();
        futures::future::join_all(supervised).await;
        futures::future::join_all(std::mem::take(&mut self.detached)).await;

        outcome
    }
}
