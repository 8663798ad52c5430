pub mod memory_store;
pub mod redis_store;
pub mod registries;
pub mod subscription;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use registries::{
    StoreScheduledTaskRegistry, StoreTaskProcessorRegistry, StoreTaskRuntimeRegistry,
};
pub use subscription::{BusMessage, MessageBusSubscription};
