//! Store-backed implementations of the domain registries.

mod processor;
mod scheduled;
mod task_runtime;

pub use processor::StoreTaskProcessorRegistry;
pub use scheduled::StoreScheduledTaskRegistry;
pub use task_runtime::StoreTaskRuntimeRegistry;
