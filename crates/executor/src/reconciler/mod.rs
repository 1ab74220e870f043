//! Keeps access-control and routing objects in step with function
//! definitions.

mod handler;
mod informer;
mod mesh;

pub use handler::FunctionEventHandler;
pub use handler::FunctionReconciler;
pub use handler::ReconcileReport;
pub use handler::ReconcilerConfig;
pub use informer::drive;
pub use informer::FunctionDelta;
pub use informer::FunctionInformer;
pub use informer::InformerStore;
pub use mesh::build_mesh_service;
