use std::fmt;

use api_types::EnvironmentReference;
use api_types::ExecutorType;
use api_types::Function;
use chrono::DateTime;
use chrono::Utc;
use kube::ResourceExt;
use uuid::Uuid;

use crate::k8s::KubeObjectRef;

/// Identifies one incarnation of a function definition. The uid changes when
/// a function is deleted and recreated under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionIdentity {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl FunctionIdentity {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
        }
    }

    pub fn of(function: &Function) -> Self {
        Self {
            name: function.name_any(),
            namespace: function.namespace().unwrap_or_default(),
            uid: function.uid().unwrap_or_default(),
        }
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function {}/{} ({})", self.namespace, self.name, self.uid)
    }
}

/// A backend serving a function, as handed to the router.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSvc {
    pub function: FunctionIdentity,
    pub environment: EnvironmentReference,
    pub address: String,
    /// Objects making up the backend, in the order they must be removed.
    pub kubernetes_objects: Vec<KubeObjectRef>,
    pub executor: ExecutorType,
    /// Distinguishes this backend from later ones built for the same function.
    pub backend_id: Uuid,
    pub ctime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
}

impl FuncSvc {
    pub fn new(
        function: FunctionIdentity,
        environment: EnvironmentReference,
        address: impl Into<String>,
        kubernetes_objects: Vec<KubeObjectRef>,
        executor: ExecutorType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            function,
            environment,
            address: address.into(),
            kubernetes_objects,
            executor,
            backend_id: Uuid::new_v4(),
            ctime: now,
            atime: now,
        }
    }
}
