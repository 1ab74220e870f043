use thiserror::Error;

use super::types::FuncSvc;
use super::types::FunctionIdentity;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Another backend was registered first; the caller owns a now
    /// redundant backend and must discard it.
    #[error("{function} already has backend {}", .existing.address)]
    Conflict {
        function: FunctionIdentity,
        existing: Box<FuncSvc>,
    },
    #[error("{function} has no cached backend")]
    NotFound { function: FunctionIdentity },
    #[error("no cached backend at {address}")]
    AddressNotFound { address: String },
}
