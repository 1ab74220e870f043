pub mod cluster;
pub mod fake;
pub mod kube_client;
pub mod kube_cluster;
pub mod types;

pub use cluster::ClusterClient;
pub use cluster::DefinitionStore;
pub use cluster::KubeResult;
pub use kube_cluster::KubeCluster;
pub use types::*;
