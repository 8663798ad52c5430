pub mod channels;
pub mod entities;
pub mod flatten;
pub mod keys;
pub mod ports;
pub mod registries;
pub mod task_types;

pub use channels::*;
pub use entities::*;
pub use ports::store::*;
pub use registries::*;
pub use task_types::*;
pub use taskproc_core::{TaskProcError, TaskProcResult};
