use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

/// Kinds of cluster objects that make up a function backend.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackendKind {
    #[display("service")]
    Service,
    #[display("horizontalpodautoscaler")]
    HorizontalPodAutoscaler,
    #[display("deployment")]
    Deployment,
    #[display("replicaset")]
    ReplicaSet,
    #[display("pod")]
    Pod,
}

impl BackendKind {
    /// Parses a kind as recorded in a backend descriptor. Matching is
    /// case-insensitive, so both `Pod` and `pod` are accepted.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "service" => Some(Self::Service),
            "horizontalpodautoscaler" => Some(Self::HorizontalPodAutoscaler),
            "deployment" => Some(Self::Deployment),
            "replicaset" => Some(Self::ReplicaSet),
            "pod" => Some(Self::Pod),
            _ => None,
        }
    }
}

/// Reference to one cluster object owned by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KubeObjectRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl KubeObjectRef {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn of(kind: BackendKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind.to_string(), namespace, name)
    }
}

impl fmt::Display for KubeObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Name and labels of a listed object; all that cleanup needs to decide
/// whether an object belongs to a stale generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledObject {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

impl LabeledObject {
    pub(crate) fn from_meta(meta: &ObjectMeta, fallback_namespace: &str) -> Self {
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta
                .namespace
                .clone()
                .unwrap_or_else(|| fallback_namespace.to_string()),
            labels: meta.labels.clone().unwrap_or_default(),
        }
    }
}

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to watch {resource}: {message}")]
    WatchFailed { resource: String, message: String },
    #[error("{target} not found")]
    NotFound { target: String },
    #[error("{target} already exists")]
    AlreadyExists { target: String },
    #[error("Conflicting write to {target}")]
    Conflict { target: String },
    #[error("Request for {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("{target} refers to {found}, expected {expected}")]
    RoleRefMismatch {
        target: String,
        expected: String,
        found: String,
    },
    #[error("Request for {target} failed")]
    RequestFailed { target: String },
}

pub fn is_not_found(report: &Report<KubernetesError>) -> bool {
    matches!(report.current_context(), KubernetesError::NotFound { .. })
}

pub fn is_already_exists(report: &Report<KubernetesError>) -> bool {
    matches!(
        report.current_context(),
        KubernetesError::AlreadyExists { .. }
    )
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn parse_backend_kind_ignores_case() {
        assert_eq!(BackendKind::parse("Pod"), Some(BackendKind::Pod));
        assert_eq!(
            BackendKind::parse("HorizontalPodAutoscaler"),
            Some(BackendKind::HorizontalPodAutoscaler)
        );
        assert_eq!(BackendKind::parse("deployment"), Some(BackendKind::Deployment));
        assert_eq!(BackendKind::parse("ConfigMap"), None);
    }

    #[test]
    fn backend_kind_display_round_trips_through_parse() {
        for kind in [
            BackendKind::Service,
            BackendKind::HorizontalPodAutoscaler,
            BackendKind::Deployment,
            BackendKind::ReplicaSet,
            BackendKind::Pod,
        ] {
            assert_eq!(BackendKind::parse(&kind.to_string()), Some(kind));
        }
    }

    #[test]
    fn error_classification() {
        let not_found = Report::new(KubernetesError::NotFound {
            target: "pod fission-function/a".to_string(),
        });
        let exists = Report::new(KubernetesError::AlreadyExists {
            target: "service envs/istio-a-ns".to_string(),
        });

        assert!(is_not_found(&not_found));
        assert!(!is_already_exists(&not_found));
        assert!(is_already_exists(&exists));
    }
}
