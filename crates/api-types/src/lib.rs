//! Shared API type definitions
//!
//! This crate contains the custom resources read by the executor: function
//! definitions and the environments they run in. Both are namespaced
//! `fission.io/v1` objects and are only ever read, never written, by the
//! executor.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// The orchestrator's default namespace.
pub const NAMESPACE_DEFAULT: &str = "default";

/// Backend used to execute a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum ExecutorType {
    /// Many functions share a pre-warmed pool of generic containers.
    #[default]
    #[serde(rename = "poolmgr")]
    Poolmgr,
    /// The function gets its own deployment and autoscaler.
    #[serde(rename = "newdeploy")]
    Newdeploy,
}

impl std::fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorType::Poolmgr => write!(f, "poolmgr"),
            ExecutorType::Newdeploy => write!(f, "newdeploy"),
        }
    }
}

/// How many functions a single specialized container may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AllowedFunctionsPerContainer {
    #[default]
    Single,
    /// Containers are shared and never considered idle.
    Infinite,
}

/// Reference from a function to the environment it runs in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionStrategy {
    #[serde(rename = "ExecutorType", default)]
    pub executor_type: ExecutorType,
    #[serde(rename = "MinScale", default)]
    pub min_scale: i32,
    #[serde(rename = "MaxScale", default = "default_max_scale")]
    pub max_scale: i32,
    #[serde(rename = "TargetCPUPercent", default)]
    pub target_cpu_percent: i32,
}

fn default_max_scale() -> i32 {
    1
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self {
            executor_type: ExecutorType::default(),
            min_scale: 0,
            max_scale: default_max_scale(),
            target_cpu_percent: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct InvokeStrategy {
    #[serde(rename = "ExecutionStrategy", default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(rename = "StrategyType", default)]
    pub strategy_type: String,
}

/// Function definition.
#[derive(CustomResource, Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "fission.io", version = "v1", kind = "Function", namespaced, derive = "PartialEq")]
pub struct FunctionSpec {
    pub environment: EnvironmentReference,
    #[serde(rename = "InvokeStrategy", default)]
    pub invoke_strategy: InvokeStrategy,
}

impl FunctionSpec {
    pub fn executor_type(&self) -> ExecutorType {
        self.invoke_strategy.execution_strategy.executor_type
    }

    pub fn min_scale(&self) -> i32 {
        self.invoke_strategy.execution_strategy.min_scale
    }

    /// Dedicated deployments with a warm minimum must stay resident.
    pub fn keeps_warm_instances(&self) -> bool {
        self.executor_type() == ExecutorType::Newdeploy && self.min_scale() > 0
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Runtime {
    pub image: String,
}

/// Environment definition.
#[derive(CustomResource, Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "fission.io", version = "v1", kind = "Environment", namespaced, derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub poolsize: i32,
    #[serde(default)]
    pub allowed_functions_per_container: AllowedFunctionsPerContainer,
}
