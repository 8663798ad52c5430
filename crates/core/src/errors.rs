use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Coordination-layer error type shared by every crate in the workspace.
#[derive(Debug, Error)]
pub enum TaskProcError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task not found: {id}")]
    TaskNotFound { id: Uuid },

    #[error("scheduled task not found: {id}")]
    ScheduledTaskNotFound { id: Uuid },

    #[error("'{name}' is not a registered task type")]
    UnknownTaskType { name: String },

    #[error("no type registered for tag '{tag}'")]
    TypeNotFound { tag: String },

    #[error("invalid state for {operation}: {message}")]
    InvalidState { operation: String, message: String },

    #[error("store operation failed ({context}): {source}")]
    Store {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("subscribe confirmation not received within {timeout:?}")]
    SubscribeTimeout { timeout: Duration },

    #[error("subscription is closed")]
    SubscriptionClosed,

    #[error("malformed record under key '{key}': {message}")]
    MalformedRecord { key: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TaskProcError {
    /// Wrap a backend failure, keeping the original cause.
    pub fn store(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            context: context.into(),
            source: Box::new(source),
        }
    }

}
