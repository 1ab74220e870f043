//! Idle backend reaper
//!
//! Periodically reclaims backends that have not served a request for longer
//! than the idle threshold. Environments whose containers are shared without
//! limit are never reaped, and neither are dedicated deployments that keep a
//! warm minimum.

use std::sync::Arc;
use std::time::Duration;

use api_types::AllowedFunctionsPerContainer;
use api_types::EnvironmentReference;
use error_stack::Report;
use error_stack::ResultExt;
use kube::ResourceExt;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::error::ExecutorError;
use crate::fscache::FuncSvc;
use crate::fscache::FunctionIdentity;
use crate::fscache::FunctionServiceCache;
use crate::k8s::is_not_found;
use crate::k8s::BackendKind;
use crate::k8s::ClusterClient;
use crate::k8s::DefinitionStore;
use crate::soft_failure::SoftFailure;

/// Outcome of one reaper pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReapReport {
    pub reaped: Vec<FunctionIdentity>,
    pub exempt: Vec<FunctionIdentity>,
    pub in_use: Vec<FunctionIdentity>,
    pub deleted_objects: usize,
    pub failures: Vec<SoftFailure>,
}

pub struct IdleReaper {
    cache: Arc<FunctionServiceCache>,
    cluster: Arc<dyn ClusterClient>,
    definitions: Arc<dyn DefinitionStore>,
    idle_threshold: Duration,
    poll_interval: Duration,
}

impl IdleReaper {
    pub fn new(
        cache: Arc<FunctionServiceCache>,
        cluster: Arc<dyn ClusterClient>,
        definitions: Arc<dyn DefinitionStore>,
        idle_threshold: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cache,
            cluster,
            definitions,
            idle_threshold,
            poll_interval,
        }
    }

    /// Runs until cancelled. Failing to list environments on the first pass
    /// means the executor cannot see its definitions at all and is returned
    /// as an error; later failures only cost that pass.
    #[tracing::instrument(skip_all, fields(idle_threshold = ?self.idle_threshold))]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<ExecutorError>> {
        info!("Starting idle reaper");
        let mut first_pass = true;

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Idle reaper shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            match self.reap_once().await {
                Ok(report) => {
                    if !report.reaped.is_empty() || !report.failures.is_empty() {
                        info!(
                            reaped = report.reaped.len(),
                            deleted_objects = report.deleted_objects,
                            failures = report.failures.len(),
                            "Reaped idle backends"
                        );
                    }
                }
                Err(e) if first_pass => return Err(e),
                Err(e) => error!("Idle reaper pass failed: {e:?}"),
            }
            first_pass = false;
        }

        Ok(())
    }

    /// One pass over every environment.
    pub async fn reap_once(&self) -> Result<ReapReport, Report<ExecutorError>> {
        let environments = self
            .definitions
            .list_environments()
            .await
            .change_context(ExecutorError::ListEnvironments)?;

        let mut report = ReapReport::default();
        for environment in environments {
            if environment.spec.allowed_functions_per_container
                == AllowedFunctionsPerContainer::Infinite
            {
                continue;
            }
            let reference = EnvironmentReference {
                name: environment.name_any(),
                namespace: environment.namespace().unwrap_or_default(),
            };
            for svc in self
                .cache
                .list_older_than(Some(&reference), self.idle_threshold)
            {
                self.reap(svc, &mut report).await;
            }
        }
        Ok(report)
    }

    /// Whether a candidate must stay even though it is idle. `None` means the
    /// definition could not be read and the candidate waits for the next pass.
    async fn is_exempt(&self, svc: &FuncSvc, report: &mut ReapReport) -> Option<bool> {
        let identity = &svc.function;
        match self
            .definitions
            .get_function(&identity.namespace, &identity.name)
            .await
        {
            Ok(function) if function.uid().as_deref() == Some(identity.uid.as_str()) => {
                Some(function.spec.keeps_warm_instances())
            }
            Ok(_) => {
                debug!(function = %identity, "Function was recreated, reaping orphaned backend");
                Some(false)
            }
            Err(e) if is_not_found(&e) => {
                debug!(function = %identity, "Function is gone, reaping orphaned backend");
                Some(false)
            }
            Err(e) => {
                report
                    .failures
                    .push(SoftFailure::from_report("get", identity.to_string(), &e));
                None
            }
        }
    }

    async fn reap(&self, svc: FuncSvc, report: &mut ReapReport) {
        match self.is_exempt(&svc, report).await {
            Some(false) => {}
            Some(true) => {
                report.exempt.push(svc.function);
                return;
            }
            None => return,
        }

        match self
            .cache
            .delete_if_idle_and_unused(&svc, self.idle_threshold)
        {
            Ok(true) => {}
            Ok(false) => {
                info!(function = %svc.function, "Not deleting backend, in use");
                report.in_use.push(svc.function);
                return;
            }
            Err(e) => {
                debug!(function = %svc.function, "Backend already removed: {e}");
                return;
            }
        }

        for object in &svc.kubernetes_objects {
            let Some(kind) = BackendKind::parse(&object.kind) else {
                error!(
                    function = %svc.function,
                    object = %object,
                    "Internal inconsistency: backend references an object of unknown kind"
                );
                continue;
            };
            match self
                .cluster
                .delete_object(kind, &object.namespace, &object.name)
                .await
            {
                Ok(()) => report.deleted_objects += 1,
                Err(e) if is_not_found(&e) => {
                    debug!(object = %object, "Backend object already gone");
                }
                Err(e) => report
                    .failures
                    .push(SoftFailure::from_report("delete", object.to_string(), &e)),
            }
        }

        let now = self.cache.now();
        info!(
            function = %svc.function,
            address = %svc.address,
            lifetime_secs = (now - svc.ctime).num_seconds(),
            idle_secs = (now - svc.atime).num_seconds(),
            "Reaped idle backend"
        );
        report.reaped.push(svc.function);
    }
}
