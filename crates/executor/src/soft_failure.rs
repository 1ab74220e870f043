use std::fmt;

use error_stack::Report;
use tracing::warn;

use crate::k8s::KubernetesError;

/// A failure that is logged and abandoned for the current cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftFailure {
    pub operation: &'static str,
    pub target: String,
    pub error: String,
}

impl SoftFailure {
    /// Records the failure and logs it at warn level.
    pub fn new(operation: &'static str, target: impl Into<String>, error: impl fmt::Display) -> Self {
        let failure = Self {
            operation,
            target: target.into(),
            error: error.to_string(),
        };
        warn!(
            operation = failure.operation,
            object = %failure.target,
            error = %failure.error,
            "Soft failure, continuing"
        );
        failure
    }

    pub fn from_report(
        operation: &'static str,
        target: impl Into<String>,
        report: &Report<KubernetesError>,
    ) -> Self {
        Self::new(operation, target, report.current_context())
    }
}

impl fmt::Display for SoftFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.operation, self.target, self.error)
    }
}
