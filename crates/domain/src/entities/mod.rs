mod processor;
mod scheduled;
mod task;

pub use processor::*;
pub use scheduled::*;
pub use task::*;
