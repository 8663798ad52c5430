use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recurring task definition: two opaque blobs stored side by side, the
/// task content and its recurrence definition.
///
/// The coordination layer never interprets the blobs. When the payload
/// serialization cannot self-describe its concrete type, the companion
/// `*_type` tags are persisted next to the blobs and resolved through the
/// task-type registry on read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub content: String,
    pub recurrence_definition: String,
    pub content_type: Option<String>,
    pub recurrence_type: Option<String>,
}

impl ScheduledTask {
    pub fn new(
        id: Uuid,
        content: impl Into<String>,
        recurrence_definition: impl Into<String>,
    ) -> Self {
        Self {
            id,
            content: content.into(),
            recurrence_definition: recurrence_definition.into(),
            content_type: None,
            recurrence_type: None,
        }
    }

    pub fn with_type_tags(
        mut self,
        content_type: impl Into<String>,
        recurrence_type: impl Into<String>,
    ) -> Self {
        self.content_type = Some(content_type.into());
        self.recurrence_type = Some(recurrence_type.into());
        self
    }
}

/// Change notification for the scheduled task registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledTaskChange {
    Added(Uuid),
    Updated(Uuid),
    Deleted(Uuid),
}

impl ScheduledTaskChange {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduledTaskChange::Added(_) => "Add",
            ScheduledTaskChange::Updated(_) => "Update",
            ScheduledTaskChange::Deleted(_) => "Delete",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            ScheduledTaskChange::Added(id)
            | ScheduledTaskChange::Updated(id)
            | ScheduledTaskChange::Deleted(id) => *id,
        }
    }
}
