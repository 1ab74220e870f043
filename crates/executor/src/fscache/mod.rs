//! Registry of the backends currently serving each function.

mod cache;
mod clock;
mod error;
mod types;

pub use cache::FunctionServiceCache;
pub use cache::InUseGuard;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use clock::TimeSource;
pub use error::CacheError;
pub use types::FuncSvc;
pub use types::FunctionIdentity;
