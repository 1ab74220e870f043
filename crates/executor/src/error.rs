use thiserror::Error;

/// Failures that stop a component rather than a single cycle.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to list environments")]
    ListEnvironments,
    #[error("Failed to set up fetcher access in {namespace}")]
    FetcherAccess { namespace: String },
}
