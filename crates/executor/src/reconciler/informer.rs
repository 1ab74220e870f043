//! Function watch loop
//!
//! The watch stream reports objects, not transitions. [`InformerStore`]
//! remembers the last state seen for every function and turns each event
//! into the add, update or delete it represents; a watch restart is diffed
//! against the store so deletions missed while disconnected still surface.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::Function;
use error_stack::Report;
use futures::Stream;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::handler::FunctionEventHandler;
use super::handler::ReconcileReport;
use crate::k8s::KubernetesError;

type FunctionKey = (String, String);

fn key_of(function: &Function) -> FunctionKey {
    (function.namespace().unwrap_or_default(), function.name_any())
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionDelta {
    Added(Function),
    Updated { old: Function, new: Function },
    Deleted(Function),
}

#[derive(Debug, Default)]
pub struct InformerStore {
    known: BTreeMap<FunctionKey, Function>,
}

impl InformerStore {
    pub fn apply(&mut self, event: Event<Function>) -> Vec<FunctionDelta> {
        match event {
            Event::Applied(function) => self.upsert(function),
            Event::Deleted(function) => {
                let previous = self.known.remove(&key_of(&function));
                vec![FunctionDelta::Deleted(previous.unwrap_or(function))]
            }
            Event::Restarted(functions) => {
                let listed: BTreeSet<FunctionKey> = functions.iter().map(key_of).collect();
                let vanished: Vec<FunctionKey> = self
                    .known
                    .keys()
                    .filter(|key| !listed.contains(*key))
                    .cloned()
                    .collect();

                let mut deltas: Vec<FunctionDelta> = vanished
                    .iter()
                    .filter_map(|key| self.known.remove(key))
                    .map(FunctionDelta::Deleted)
                    .collect();
                for function in functions {
                    deltas.extend(self.upsert(function));
                }
                deltas
            }
        }
    }

    fn upsert(&mut self, function: Function) -> Vec<FunctionDelta> {
        let key = key_of(&function);
        match self.known.insert(key, function.clone()) {
            None => vec![FunctionDelta::Added(function)],
            // recreated under the same name
            Some(previous) if previous.uid() != function.uid() => vec![
                FunctionDelta::Deleted(previous),
                FunctionDelta::Added(function),
            ],
            Some(previous)
                if previous.resource_version().is_some()
                    && previous.resource_version() == function.resource_version() =>
            {
                Vec::new()
            }
            Some(previous) => vec![FunctionDelta::Updated {
                old: previous,
                new: function,
            }],
        }
    }

    pub fn functions(&self) -> Vec<Function> {
        self.known.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

async fn dispatch(handler: &dyn FunctionEventHandler, delta: FunctionDelta) {
    let (action, name, report): (&str, String, ReconcileReport) = match &delta {
        FunctionDelta::Added(function) => ("add", function.name_any(), handler.on_add(function).await),
        FunctionDelta::Updated { old, new } => {
            ("update", new.name_any(), handler.on_update(old, new).await)
        }
        FunctionDelta::Deleted(function) => {
            ("delete", function.name_any(), handler.on_delete(function).await)
        }
    };
    if !report.failures.is_empty() {
        warn!(
            action,
            function = %name,
            failures = report.failures.len(),
            "Function reconcile finished with failures"
        );
    }
}

/// Feeds watch events through `store` into `handler` until the stream ends
/// or fails, replaying the add path for every known function each
/// `resync_period`.
pub async fn drive<S>(
    stream: S,
    store: &mut InformerStore,
    handler: &dyn FunctionEventHandler,
    resync_period: Duration,
) -> Result<(), Report<KubernetesError>>
where
    S: Stream<Item = Result<Event<Function>, watcher::Error>> + Send,
{
    let mut stream = std::pin::pin!(stream);
    let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + resync_period, resync_period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for delta in store.apply(event) {
                        dispatch(handler, delta).await;
                    }
                }
                Some(Err(e)) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        resource: "functions".to_string(),
                        message: format!("Watch stream error: {e}"),
                    }));
                }
                None => return Ok(()),
            },
            _ = resync.tick() => {
                debug!(functions = store.len(), "Resyncing functions");
                for function in store.functions() {
                    dispatch(handler, FunctionDelta::Added(function)).await;
                }
            }
        }
    }
}

/// Watches function definitions in all namespaces.
pub struct FunctionInformer {
    client: Client,
    handler: Arc<dyn FunctionEventHandler>,
    resync_period: Duration,
}

impl FunctionInformer {
    pub fn new(
        client: Client,
        handler: Arc<dyn FunctionEventHandler>,
        resync_period: Duration,
    ) -> Self {
        Self {
            client,
            handler,
            resync_period,
        }
    }

    /// Runs until cancelled, restarting the watch whenever it ends or fails.
    #[tracing::instrument(skip_all, fields(resync_period = ?self.resync_period))]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<KubernetesError>> {
        info!("Starting function informer");
        let mut store = InformerStore::default();

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Function informer shutdown requested");
                    break;
                }
                result = self.watch_functions(&mut store) => {
                    match result {
                        Ok(()) => {
                            warn!("Function watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Function watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn watch_functions(&self, store: &mut InformerStore) -> Result<(), Report<KubernetesError>> {
        let api: Api<Function> = Api::all(self.client.clone());
        drive(
            watcher(api, Config::default()),
            store,
            self.handler.as_ref(),
            self.resync_period,
        )
        .await
    }
}
