use std::collections::BTreeMap;

use api_types::Function;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::api::core::v1::ServiceSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::naming::mesh_service_name;
use crate::naming::FETCH_PORT;
use crate::naming::FUNCTION_NAME_LABEL;
use crate::naming::FUNCTION_UID_LABEL;
use crate::naming::SPECIALIZE_PORT;

fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

/// Service the mesh routes a function's traffic through. It lives next to
/// the pool pods, in the environment namespace, and selects the pod
/// specialized for this exact function incarnation.
pub fn build_mesh_service(function: &Function, env_namespace: &str) -> Service {
    let name = function.name_any();
    let namespace = function.namespace().unwrap_or_default();
    let selector = BTreeMap::from([
        (FUNCTION_NAME_LABEL.to_string(), name.clone()),
        (
            FUNCTION_UID_LABEL.to_string(),
            function.uid().unwrap_or_default(),
        ),
    ]);

    Service {
        metadata: ObjectMeta {
            name: Some(mesh_service_name(&name, &namespace)),
            namespace: Some(env_namespace.to_string()),
            labels: Some(BTreeMap::from([(FUNCTION_NAME_LABEL.to_string(), name)])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            // the mesh treats unprefixed port names as plain TCP
            ports: Some(vec![
                tcp_port("fetch", FETCH_PORT),
                tcp_port("specialize", SPECIALIZE_PORT),
            ]),
            selector: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use api_types::FunctionSpec;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn mesh_service_selects_function_incarnation() {
        let mut function = Function::new("hello", FunctionSpec::default());
        function.metadata.namespace = Some("ns1".to_string());
        function.metadata.uid = Some("uid-1".to_string());

        let service = build_mesh_service(&function, "envs");

        assert_eq!(service.metadata.name.as_deref(), Some("istio-hello-ns1"));
        assert_eq!(service.metadata.namespace.as_deref(), Some("envs"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let selector = spec.selector.unwrap();
        assert_eq!(selector.get(FUNCTION_NAME_LABEL).map(String::as_str), Some("hello"));
        assert_eq!(selector.get(FUNCTION_UID_LABEL).map(String::as_str), Some("uid-1"));
        let ports: Vec<(Option<String>, i32)> = spec
            .ports
            .unwrap()
            .into_iter()
            .map(|port| (port.name, port.port))
            .collect();
        assert_eq!(
            ports,
            vec![
                (Some("fetch".to_string()), 8000),
                (Some("specialize".to_string()), 8888)
            ]
        );
    }
}
