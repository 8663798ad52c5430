pub mod config;
pub mod errors;
pub mod logging;

pub use config::*;
pub use errors::*;
pub use logging::init_logging;

/// Unified result type used across the workspace.
pub type TaskProcResult<T> = std::result::Result<T, TaskProcError>;
