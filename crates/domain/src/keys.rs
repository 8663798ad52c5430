//! Persisted key layout.
//!
//! These strings are the wire-compatible store schema; changing any of them
//! breaks interoperability with existing cluster members.

use uuid::Uuid;

pub const PENDING_TASKS: &str = "PendingTasks";
pub const ACTIVE_TASKS: &str = "ActiveTasks";
pub const FAILED_TASKS: &str = "FailedTasks";
pub const ARCHIVE_TASKS: &str = "ArchiveTasks";
pub const TASK_PROCESSORS: &str = "TaskProcessors";
pub const MASTER_TASK_PROCESSOR: &str = "MasterTaskProcessor";
pub const SCHEDULED_TASKS: &str = "ScheduledTasks";

/// Live record of a pending or in-progress task.
pub fn task_runtime_info(id: Uuid) -> String {
    format!("TaskRuntimeInfo${id}")
}

/// Pending list of the named polling queue.
pub fn polling_queue(queue_key: &str) -> String {
    format!("{PENDING_TASKS}${queue_key}")
}

/// Pattern matching every per-queue pending list.
pub const POLLING_QUEUE_PATTERN: &str = "PendingTasks$*";

/// Registration record of a task processor.
pub fn task_processor(id: Uuid) -> String {
    format!("TaskProcessor${id}")
}

pub fn scheduled_task_content(id: Uuid) -> String {
    format!("{id}$Content")
}

pub fn scheduled_task_recurrence(id: Uuid) -> String {
    format!("{id}$RecurrenceDefinition")
}

pub fn scheduled_task_content_type(id: Uuid) -> String {
    format!("{id}$Content$Type")
}

pub fn scheduled_task_recurrence_type(id: Uuid) -> String {
    format!("{id}$RecurrenceDefinition$Type")
}
