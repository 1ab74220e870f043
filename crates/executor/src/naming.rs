//! Deterministic names and labels shared by every component.

use std::collections::BTreeMap;

use api_types::NAMESPACE_DEFAULT;
use uuid::Uuid;

/// Label stamped on every backend object; its value is the id of the
/// executor instance that created the object.
pub const INSTANCE_ID_LABEL: &str = "executorInstanceId";
pub const FUNCTION_NAME_LABEL: &str = "functionName";
pub const FUNCTION_UID_LABEL: &str = "functionUid";

pub const DEFAULT_FUNCTION_NAMESPACE: &str = "fission-function";

pub const FETCHER_SERVICE_ACCOUNT: &str = "fission-fetcher";
pub const SECRET_CONFIGMAP_GETTER_ROLE: &str = "secret-configmap-getter";
pub const SECRET_CONFIGMAP_GETTER_BINDING: &str = "secret-configmap-getter-binding";
pub const PACKAGE_GETTER_ROLE: &str = "package-getter";
pub const PACKAGE_GETTER_BINDING: &str = "package-getter-binding";

pub const FETCH_PORT: i32 = 8000;
pub const SPECIALIZE_PORT: i32 = 8888;

/// Router path for a function. Functions in the default namespace keep the
/// short form.
pub fn url_for_function(name: &str, namespace: &str) -> String {
    if namespace == NAMESPACE_DEFAULT {
        format!("/fission-function/{name}")
    } else {
        format!("/fission-function/{namespace}/{name}")
    }
}

pub fn mesh_service_name(function_name: &str, function_namespace: &str) -> String {
    format!("istio-{function_name}-{function_namespace}")
}

pub fn new_instance_id() -> String {
    Uuid::new_v4().to_string()
}

/// Labels every backend created by the instance carries.
pub fn instance_labels(instance_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(INSTANCE_ID_LABEL.to_string(), instance_id.to_string())])
}

/// Namespace whose fetcher serves a function's environment. Environments in
/// the default namespace run their pods in the function namespace.
pub fn environment_namespace(env_namespace: &str, function_namespace: &str) -> String {
    if env_namespace.is_empty() || env_namespace == NAMESPACE_DEFAULT {
        function_namespace.to_string()
    } else {
        env_namespace.to_string()
    }
}
