//! Registry abstractions over the store capability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{ScheduledTask, TaskPriority, TaskProcessorRuntimeInfo, TaskRuntimeInfo};
use taskproc_core::TaskProcResult;

/// Both status buckets of live tasks. Both fields are always populated,
/// even when empty, so consumers can rely on the keys being present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingAndActive {
    pub pending: Vec<TaskRuntimeInfo>,
    pub active: Vec<TaskRuntimeInfo>,
}

/// Task lifecycle state machine and polling-queue leasing.
#[async_trait]
pub trait TaskRuntimeRegistry: Send + Sync {
    /// Build a transient, unpersisted record. Fails when `task_type` is not
    /// a registered task type.
    fn create(
        &self,
        id: Uuid,
        task_type: &str,
        submitted_utc: DateTime<Utc>,
        priority: TaskPriority,
        polling_queue: Option<String>,
    ) -> TaskProcResult<TaskRuntimeInfo>;

    /// Persist a fresh record and enqueue its id on the global pending list
    /// or its polling queue.
    async fn add(&self, info: &TaskRuntimeInfo) -> TaskProcResult<()>;

    /// Optimistic intent marker; updates only the processor id.
    async fn assign(&self, id: Uuid, processor_id: Option<Uuid>) -> TaskProcResult<()>;

    async fn start(
        &self,
        id: Uuid,
        processor_id: Uuid,
        timestamp_utc: DateTime<Utc>,
    ) -> TaskProcResult<()>;

    /// High-frequency single-field update, intentionally not transactional.
    async fn progress(&self, id: Uuid, percentage: f64) -> TaskProcResult<()>;

    async fn request_cancel(&self, id: Uuid, timestamp_utc: DateTime<Utc>) -> TaskProcResult<()>;

    /// Stamp the completion time on a record already archived by
    /// [`TaskRuntimeRegistry::request_cancel`].
    async fn complete_cancel(&self, id: Uuid, timestamp_utc: DateTime<Utc>) -> TaskProcResult<()>;

    async fn fail(
        &self,
        id: Uuid,
        timestamp_utc: DateTime<Utc>,
        error: &str,
    ) -> TaskProcResult<()>;

    async fn complete(&self, id: Uuid, timestamp_utc: DateTime<Utc>) -> TaskProcResult<()>;

    /// Lease up to `max_results` tasks from the front of the named polling
    /// queue. A returned task is removed from the queue; the caller owns it
    /// and is expected to call `start` promptly.
    async fn reserve_polling_queue_tasks(
        &self,
        queue_key: &str,
        max_results: usize,
    ) -> TaskProcResult<Vec<TaskRuntimeInfo>>;

    async fn get_pending(
        &self,
        include_polling_queue_tasks: bool,
    ) -> TaskProcResult<Vec<TaskRuntimeInfo>>;

    async fn get_active(&self) -> TaskProcResult<Vec<TaskRuntimeInfo>>;
    async fn get_failed(&self) -> TaskProcResult<Vec<TaskRuntimeInfo>>;
    async fn get_archive(&self) -> TaskProcResult<Vec<TaskRuntimeInfo>>;
    async fn get_pending_and_active(&self) -> TaskProcResult<PendingAndActive>;

    /// O(1) existence check for the live record; by the core invariant,
    /// existence means Pending or InProgress.
    async fn check_is_pending_or_active(&self, id: Uuid) -> TaskProcResult<bool>;

    /// Task type of a live record, falling back to the archive.
    async fn get_task_type(&self, id: Uuid) -> TaskProcResult<Option<String>>;
}

/// Liveness registration and single-master election for task processors.
#[async_trait]
pub trait TaskProcessorRegistry: Send + Sync {
    async fn add(&self, info: &TaskProcessorRuntimeInfo) -> TaskProcResult<()>;
    async fn update(&self, info: &TaskProcessorRuntimeInfo) -> TaskProcResult<()>;
    async fn get_by_id(&self, id: Uuid) -> TaskProcResult<Option<TaskProcessorRuntimeInfo>>;

    /// All registered processors, skipping set members whose backing record
    /// has already expired.
    async fn get_all(&self) -> TaskProcResult<Vec<TaskProcessorRuntimeInfo>>;

    /// Renew the registration TTL; returns false when the registration has
    /// already expired.
    async fn heartbeat(&self, id: Uuid) -> TaskProcResult<bool>;

    async fn delete(&self, id: Uuid) -> TaskProcResult<()>;

    async fn get_master_id(&self) -> TaskProcResult<Option<Uuid>>;
    async fn set_master(&self, id: Uuid) -> TaskProcResult<()>;

    /// Contend for the master role; returns whether this caller won.
    async fn set_master_if_not_exists(&self, id: Uuid) -> TaskProcResult<bool>;

    async fn clear_master(&self) -> TaskProcResult<()>;

    /// Renew the master TTL; returns false when the key had already expired
    /// and the caller must re-contend.
    async fn master_heartbeat(&self) -> TaskProcResult<bool>;
}

/// CRUD plus change notification for recurring task definitions.
#[async_trait]
pub trait ScheduledTaskRegistry: Send + Sync {
    async fn add(&self, task: &ScheduledTask) -> TaskProcResult<()>;
    async fn update(&self, task: &ScheduledTask) -> TaskProcResult<()>;
    async fn delete(&self, id: Uuid) -> TaskProcResult<()>;
    async fn get_by_id(&self, id: Uuid) -> TaskProcResult<Option<ScheduledTask>>;
    async fn get_all(&self) -> TaskProcResult<Vec<ScheduledTask>>;
}
