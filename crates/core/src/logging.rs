use tracing_subscriber::EnvFilter;

use crate::{TaskProcError, TaskProcResult};

/// Install a global `tracing` subscriber.
///
/// `filter` uses the usual env-filter syntax (`info`,
/// `taskproc_infrastructure=debug`, ...). Calling this twice returns an
/// error rather than silently replacing the subscriber.
pub fn init_logging(filter: &str) -> TaskProcResult<()> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|e| TaskProcError::Configuration(format!("invalid log filter: {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| TaskProcError::Configuration(format!("logging already initialized: {e}")))
}
