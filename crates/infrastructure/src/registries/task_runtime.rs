//! Task lifecycle state machine over the store capability.
//!
//! A live record (hash under `TaskRuntimeInfo$<id>`) exists exactly while
//! the task is Pending or InProgress. Every terminal transition deletes the
//! live record and writes the full record as a JSON blob into the archive
//! hash, inside one transaction with the list moves, so a crash can never
//! leave an id referenced by a list without a backing record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use taskproc_core::{TaskProcError, TaskProcResult};
use taskproc_domain::{
    keys, PendingAndActive, Store, StoreBatch, TaskPriority, TaskRuntimeInfo, TaskStatus,
    TaskTypeRegistry, TaskRuntimeRegistry,
};

pub struct StoreTaskRuntimeRegistry {
    store: Arc<dyn Store>,
    task_types: Arc<TaskTypeRegistry>,
}

impl StoreTaskRuntimeRegistry {
    pub fn new(store: Arc<dyn Store>, task_types: Arc<TaskTypeRegistry>) -> Self {
        Self { store, task_types }
    }

    /// Pending list this record is enqueued on.
    fn pending_list(info: &TaskRuntimeInfo) -> String {
        match &info.polling_queue {
            Some(queue) => keys::polling_queue(queue),
            None => keys::PENDING_TASKS.to_string(),
        }
    }

    async fn read_live(&self, id: Uuid) -> TaskProcResult<TaskRuntimeInfo> {
        let key = keys::task_runtime_info(id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Err(TaskProcError::TaskNotFound { id });
        }
        TaskRuntimeInfo::from_fields(&key, &fields)
    }

    async fn read_archived(&self, id: Uuid) -> TaskProcResult<TaskRuntimeInfo> {
        let raw = self
            .store
            .hash_get(keys::ARCHIVE_TASKS, &id.to_string())
            .await?
            .ok_or(TaskProcError::TaskNotFound { id })?;
        parse_archive_entry(&id.to_string(), &raw)
    }

    /// Fetch the live records for a batch of list-stored ids in one round
    /// trip. Ids whose record vanished between the list read and the fetch
    /// are skipped, as are ids that do not parse.
    async fn fetch_live_records(&self, ids: &[String]) -> TaskProcResult<Vec<TaskRuntimeInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = StoreBatch::new();
        let mut record_keys = Vec::with_capacity(ids.len());
        for raw in ids {
            match Uuid::parse_str(raw) {
                Ok(id) => {
                    let key = keys::task_runtime_info(id);
                    batch.hash_get_all(key.clone());
                    record_keys.push(key);
                }
                Err(_) => warn!(id = %raw, "skipping unparsable id on a task list"),
            }
        }
        let replies = self.store.run_pipeline(batch).await?;
        let mut records = Vec::with_capacity(record_keys.len());
        for (key, reply) in record_keys.into_iter().zip(replies) {
            let fields = reply.into_map();
            if fields.is_empty() {
                continue;
            }
            records.push(TaskRuntimeInfo::from_fields(&key, &fields)?);
        }
        Ok(records)
    }

    /// Terminal transition: delete the live record, apply the list moves,
    /// write the archive blob, all-or-nothing.
    async fn archive_transition(
        &self,
        info: &TaskRuntimeInfo,
        list_ops: impl FnOnce(&mut StoreBatch, &str),
    ) -> TaskProcResult<()> {
        let id = info.task_id.to_string();
        let mut batch = StoreBatch::new();
        batch.delete(keys::task_runtime_info(info.task_id));
        list_ops(&mut batch, &id);
        batch.hash_set_many(keys::ARCHIVE_TASKS, vec![(id, archive_entry(info)?)]);
        self.store.run_transaction(batch).await
    }
}

fn archive_entry(info: &TaskRuntimeInfo) -> TaskProcResult<String> {
    serde_json::to_string(info)
        .map_err(|e| TaskProcError::Serialization(format!("archive entry: {e}")))
}

fn parse_archive_entry(id: &str, raw: &str) -> TaskProcResult<TaskRuntimeInfo> {
    serde_json::from_str(raw).map_err(|e| TaskProcError::MalformedRecord {
        key: format!("{}[{id}]", keys::ARCHIVE_TASKS),
        message: e.to_string(),
    })
}

#[async_trait]
impl TaskRuntimeRegistry for StoreTaskRuntimeRegistry {
    fn create(
        &self,
        id: Uuid,
        task_type: &str,
        submitted_utc: DateTime<Utc>,
        priority: TaskPriority,
        polling_queue: Option<String>,
    ) -> TaskProcResult<TaskRuntimeInfo> {
        if !self.task_types.is_task_type(task_type) {
            return Err(TaskProcError::UnknownTaskType {
                name: task_type.to_string(),
            });
        }
        Ok(TaskRuntimeInfo::new(
            id,
            task_type,
            submitted_utc,
            priority,
            polling_queue,
        ))
    }

    async fn add(&self, info: &TaskRuntimeInfo) -> TaskProcResult<()> {
        if !info.is_fresh() {
            return Err(TaskProcError::InvalidState {
                operation: "add".to_string(),
                message: "record must be fresh: Pending, unassigned, zero progress".to_string(),
            });
        }
        let mut batch = StoreBatch::new();
        batch.hash_set_many(keys::task_runtime_info(info.task_id), info.to_fields());
        batch.list_append(Self::pending_list(info), info.task_id.to_string());
        self.store.run_transaction(batch).await?;
        debug!(task_id = %info.task_id, task_type = %info.task_type, "task added");
        Ok(())
    }

    async fn assign(&self, id: Uuid, processor_id: Option<Uuid>) -> TaskProcResult<()> {
        let key = keys::task_runtime_info(id);
        if !self.store.exists(&key).await? {
            return Err(TaskProcError::TaskNotFound { id });
        }
        match processor_id {
            Some(processor_id) => {
                self.store
                    .hash_set(&key, "TaskProcessorId", &processor_id.to_string())
                    .await
            }
            None => {
                self.store
                    .hash_delete_fields(&key, &["TaskProcessorId".to_string()])
                    .await?;
                Ok(())
            }
        }
    }

    async fn start(
        &self,
        id: Uuid,
        processor_id: Uuid,
        timestamp_utc: DateTime<Utc>,
    ) -> TaskProcResult<()> {
        let mut info = self.read_live(id).await?;
        if info.status != TaskStatus::Pending {
            return Err(TaskProcError::InvalidState {
                operation: "start".to_string(),
                message: format!("expected Pending, found {}", info.status.as_str()),
            });
        }
        info.status = TaskStatus::InProgress;
        info.task_processor_id = Some(processor_id);
        info.started_utc = Some(timestamp_utc);

        let mut batch = StoreBatch::new();
        batch.hash_set_many(keys::task_runtime_info(id), info.to_fields());
        batch.list_remove(Self::pending_list(&info), id.to_string());
        batch.list_append(keys::ACTIVE_TASKS, id.to_string());
        self.store.run_transaction(batch).await?;
        debug!(task_id = %id, processor_id = %processor_id, "task started");
        Ok(())
    }

    async fn progress(&self, id: Uuid, percentage: f64) -> TaskProcResult<()> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(TaskProcError::InvalidArgument(format!(
                "percentage must be within [0, 100], got {percentage}"
            )));
        }
        let key = keys::task_runtime_info(id);
        if !self.store.exists(&key).await? {
            return Err(TaskProcError::TaskNotFound { id });
        }
        self.store
            .hash_set(&key, "Percentage", &percentage.to_string())
            .await
    }

    async fn request_cancel(&self, id: Uuid, timestamp_utc: DateTime<Utc>) -> TaskProcResult<()> {
        let mut info = self.read_live(id).await?;
        info.status = TaskStatus::Canceled;
        info.canceled_utc = Some(timestamp_utc);

        let pending_list = Self::pending_list(&info);
        self.archive_transition(&info, |batch, id| {
            // At most one of the two lists actually holds the id.
            batch.list_remove(pending_list, id);
            batch.list_remove(keys::ACTIVE_TASKS, id);
        })
        .await?;
        debug!(task_id = %id, "task canceled");
        Ok(())
    }

    async fn complete_cancel(&self, id: Uuid, timestamp_utc: DateTime<Utc>) -> TaskProcResult<()> {
        let mut info = self.read_archived(id).await?;
        if info.status != TaskStatus::Canceled {
            return Err(TaskProcError::InvalidState {
                operation: "complete_cancel".to_string(),
                message: format!("expected archived Canceled, found {}", info.status.as_str()),
            });
        }
        info.completed_utc = Some(timestamp_utc);
        self.store
            .hash_set(keys::ARCHIVE_TASKS, &id.to_string(), &archive_entry(&info)?)
            .await
    }

    async fn fail(
        &self,
        id: Uuid,
        timestamp_utc: DateTime<Utc>,
        error: &str,
    ) -> TaskProcResult<()> {
        if error.is_empty() {
            return Err(TaskProcError::InvalidArgument(
                "error description must not be empty".to_string(),
            ));
        }
        let mut info = self.read_live(id).await?;
        if info.status != TaskStatus::InProgress {
            return Err(TaskProcError::InvalidState {
                operation: "fail".to_string(),
                message: format!("expected InProgress, found {}", info.status.as_str()),
            });
        }
        info.status = TaskStatus::Failed;
        info.completed_utc = Some(timestamp_utc);
        info.error = Some(error.to_string());

        self.archive_transition(&info, |batch, id| {
            batch.list_remove(keys::ACTIVE_TASKS, id);
            batch.list_append(keys::FAILED_TASKS, id);
        })
        .await?;
        debug!(task_id = %id, "task failed");
        Ok(())
    }

    async fn complete(&self, id: Uuid, timestamp_utc: DateTime<Utc>) -> TaskProcResult<()> {
        let mut info = self.read_live(id).await?;
        if info.status != TaskStatus::InProgress {
            return Err(TaskProcError::InvalidState {
                operation: "complete".to_string(),
                message: format!("expected InProgress, found {}", info.status.as_str()),
            });
        }
        info.status = TaskStatus::Success;
        info.percentage = 100.0;
        info.completed_utc = Some(timestamp_utc);

        self.archive_transition(&info, |batch, id| {
            batch.list_remove(keys::ACTIVE_TASKS, id);
        })
        .await?;
        debug!(task_id = %id, "task completed");
        Ok(())
    }

    async fn reserve_polling_queue_tasks(
        &self,
        queue_key: &str,
        max_results: usize,
    ) -> TaskProcResult<Vec<TaskRuntimeInfo>> {
        if queue_key.is_empty() {
            return Err(TaskProcError::InvalidArgument(
                "queue key must not be empty".to_string(),
            ));
        }
        if max_results == 0 {
            return Ok(Vec::new());
        }
        let queue = keys::polling_queue(queue_key);
        let mut batch = StoreBatch::new();
        for _ in 0..max_results {
            batch.list_pop_first(queue.clone());
        }
        let ids: Vec<String> = self
            .store
            .run_pipeline(batch)
            .await?
            .into_iter()
            .filter_map(|reply| reply.into_value())
            .collect();
        self.fetch_live_records(&ids).await
    }

    async fn get_pending(
        &self,
        include_polling_queue_tasks: bool,
    ) -> TaskProcResult<Vec<TaskRuntimeInfo>> {
        let ids = self.store.list_all(keys::PENDING_TASKS).await?;
        let mut records = self.fetch_live_records(&ids).await?;

        if include_polling_queue_tasks {
            for queue in self.store.search_keys(keys::POLLING_QUEUE_PATTERN).await? {
                let queue_ids = self.store.list_all(&queue).await?;
                let queued = self.fetch_live_records(&queue_ids).await?;
                // A concurrent reservation may have started one of these
                // already; only genuinely pending records qualify.
                records.extend(queued.into_iter().filter(|r| r.status == TaskStatus::Pending));
            }
        }
        Ok(records)
    }

    async fn get_active(&self) -> TaskProcResult<Vec<TaskRuntimeInfo>> {
        let ids = self.store.list_all(keys::ACTIVE_TASKS).await?;
        self.fetch_live_records(&ids).await
    }

    async fn get_failed(&self) -> TaskProcResult<Vec<TaskRuntimeInfo>> {
        let ids = self.store.list_all(keys::FAILED_TASKS).await?;
        let archive = self.store.hash_get_all(keys::ARCHIVE_TASKS).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in &ids {
            match archive.get(id) {
                Some(raw) => records.push(parse_archive_entry(id, raw)?),
                None => warn!(id = %id, "failed-task id missing from archive"),
            }
        }
        Ok(records)
    }

    async fn get_archive(&self) -> TaskProcResult<Vec<TaskRuntimeInfo>> {
        let archive = self.store.hash_get_all(keys::ARCHIVE_TASKS).await?;
        archive
            .iter()
            .map(|(id, raw)| parse_archive_entry(id, raw))
            .collect()
    }

    async fn get_pending_and_active(&self) -> TaskProcResult<PendingAndActive> {
        Ok(PendingAndActive {
            pending: self.get_pending(false).await?,
            active: self.get_active().await?,
        })
    }

    async fn check_is_pending_or_active(&self, id: Uuid) -> TaskProcResult<bool> {
        self.store.exists(&keys::task_runtime_info(id)).await
    }

    async fn get_task_type(&self, id: Uuid) -> TaskProcResult<Option<String>> {
        if let Some(task_type) = self
            .store
            .hash_get(&keys::task_runtime_info(id), "TaskType")
            .await?
        {
            return Ok(Some(task_type));
        }
        match self
            .store
            .hash_get(keys::ARCHIVE_TASKS, &id.to_string())
            .await?
        {
            Some(raw) => Ok(Some(parse_archive_entry(&id.to_string(), &raw)?.task_type)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use taskproc_core::TypeResolutionPolicy;

    fn registry() -> (StoreTaskRuntimeRegistry, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let task_types = Arc::new(TaskTypeRegistry::new(TypeResolutionPolicy::Strict));
        task_types.register("report").unwrap();
        (StoreTaskRuntimeRegistry::new(store.clone(), task_types), store)
    }

    fn fresh_task(
        registry: &StoreTaskRuntimeRegistry,
        polling_queue: Option<&str>,
    ) -> TaskRuntimeInfo {
        registry
            .create(
                Uuid::new_v4(),
                "report",
                Utc::now(),
                TaskPriority::Normal,
                polling_queue.map(str::to_string),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn added_task_is_pending_on_exactly_one_list() {
        let (registry, store) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();

        assert!(registry
            .check_is_pending_or_active(info.task_id)
            .await
            .unwrap());
        let global = store.list_all(keys::PENDING_TASKS).await.unwrap();
        assert_eq!(global, vec![info.task_id.to_string()]);

        let queued = fresh_task(&registry, Some("bulk"));
        registry.add(&queued).await.unwrap();
        let global = store.list_all(keys::PENDING_TASKS).await.unwrap();
        assert!(!global.contains(&queued.task_id.to_string()));
        let queue = store.list_all(&keys::polling_queue("bulk")).await.unwrap();
        assert_eq!(queue, vec![queued.task_id.to_string()]);
    }

    #[tokio::test]
    async fn create_rejects_unregistered_task_type() {
        let (registry, _) = registry();
        let err = registry
            .create(Uuid::new_v4(), "ghost", Utc::now(), TaskPriority::Low, None)
            .unwrap_err();
        assert!(matches!(err, TaskProcError::UnknownTaskType { .. }));
    }

    #[tokio::test]
    async fn add_rejects_non_fresh_record() {
        let (registry, _) = registry();
        let mut info = fresh_task(&registry, None);
        info.percentage = 50.0;
        assert!(matches!(
            registry.add(&info).await,
            Err(TaskProcError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn start_moves_the_task_to_the_active_list() {
        let (registry, store) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();

        let processor = Uuid::new_v4();
        registry.start(info.task_id, processor, Utc::now()).await.unwrap();

        assert!(store.list_all(keys::PENDING_TASKS).await.unwrap().is_empty());
        let active = registry.get_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, TaskStatus::InProgress);
        assert_eq!(active[0].task_processor_id, Some(processor));
    }

    #[tokio::test]
    async fn start_requires_a_pending_task() {
        let (registry, _) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();
        registry
            .start(info.task_id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            registry.start(info.task_id, Uuid::new_v4(), Utc::now()).await,
            Err(TaskProcError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn progress_rejects_out_of_range_before_any_write() {
        let (registry, _) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();
        assert!(matches!(
            registry.progress(info.task_id, 101.0).await,
            Err(TaskProcError::InvalidArgument(_))
        ));
        registry.progress(info.task_id, 33.5).await.unwrap();
    }

    #[tokio::test]
    async fn complete_archives_with_full_progress() {
        let (registry, _) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();
        registry
            .start(info.task_id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        let completed_at = Utc::now();
        registry.complete(info.task_id, completed_at).await.unwrap();

        assert!(!registry
            .check_is_pending_or_active(info.task_id)
            .await
            .unwrap());
        let archive = registry.get_archive().await.unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].status, TaskStatus::Success);
        assert_eq!(archive[0].percentage, 100.0);
        assert_eq!(archive[0].completed_utc, Some(completed_at));
    }

    #[tokio::test]
    async fn failed_task_lands_on_the_failed_list_and_archive() {
        let (registry, _) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();
        registry
            .start(info.task_id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        registry
            .fail(info.task_id, Utc::now(), "out of disk space")
            .await
            .unwrap();

        let failed = registry.get_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, TaskStatus::Failed);
        assert_eq!(failed[0].error.as_deref(), Some("out of disk space"));
        assert!(!registry
            .check_is_pending_or_active(info.task_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn fail_requires_a_non_empty_error() {
        let (registry, _) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();
        registry
            .start(info.task_id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            registry.fail(info.task_id, Utc::now(), "").await,
            Err(TaskProcError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn cancel_of_a_pending_task_archives_it() {
        let (registry, store) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();

        let canceled_at = Utc::now();
        registry.request_cancel(info.task_id, canceled_at).await.unwrap();

        assert!(store.list_all(keys::PENDING_TASKS).await.unwrap().is_empty());
        let archive = registry.get_archive().await.unwrap();
        assert_eq!(archive[0].status, TaskStatus::Canceled);
        assert_eq!(archive[0].canceled_utc, Some(canceled_at));
        assert_eq!(archive[0].completed_utc, None);
    }

    #[tokio::test]
    async fn complete_cancel_stamps_the_archived_record() {
        let (registry, _) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();
        registry
            .start(info.task_id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        registry.request_cancel(info.task_id, Utc::now()).await.unwrap();

        let completed_at = Utc::now();
        registry
            .complete_cancel(info.task_id, completed_at)
            .await
            .unwrap();
        let archive = registry.get_archive().await.unwrap();
        assert_eq!(archive[0].completed_utc, Some(completed_at));
        assert_eq!(archive[0].status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn reservation_never_hands_out_the_same_id_twice() {
        let (registry, _) = registry();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let info = fresh_task(&registry, Some("bulk"));
            ids.push(info.task_id);
            registry.add(&info).await.unwrap();
        }

        let first = registry.reserve_polling_queue_tasks("bulk", 3).await.unwrap();
        let second = registry.reserve_polling_queue_tasks("bulk", 3).await.unwrap();
        assert_eq!(first.len(), 3);
        // More requested than remained available.
        assert_eq!(second.len(), 2);

        let mut seen: Vec<Uuid> = first
            .iter()
            .chain(second.iter())
            .map(|r| r.task_id)
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);

        let drained = registry.reserve_polling_queue_tasks("bulk", 3).await.unwrap();
        assert!(drained.is_empty());
    }

    #[tokio::test]
    async fn reservation_validates_its_arguments() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.reserve_polling_queue_tasks("", 3).await,
            Err(TaskProcError::InvalidArgument(_))
        ));
        assert!(registry
            .reserve_polling_queue_tasks("bulk", 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn get_pending_unions_polling_queues_on_request() {
        let (registry, _) = registry();
        let global = fresh_task(&registry, None);
        let queued = fresh_task(&registry, Some("bulk"));
        registry.add(&global).await.unwrap();
        registry.add(&queued).await.unwrap();

        let without = registry.get_pending(false).await.unwrap();
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].task_id, global.task_id);

        let with = registry.get_pending(true).await.unwrap();
        let mut ids: Vec<Uuid> = with.iter().map(|r| r.task_id).collect();
        ids.sort();
        let mut expected = vec![global.task_id, queued.task_id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn pending_and_active_always_carries_both_buckets() {
        let (registry, _) = registry();
        let both = registry.get_pending_and_active().await.unwrap();
        assert!(both.pending.is_empty());
        assert!(both.active.is_empty());
    }

    #[tokio::test]
    async fn task_type_falls_back_to_the_archive() {
        let (registry, _) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();
        assert_eq!(
            registry.get_task_type(info.task_id).await.unwrap(),
            Some("report".to_string())
        );

        registry.request_cancel(info.task_id, Utc::now()).await.unwrap();
        assert_eq!(
            registry.get_task_type(info.task_id).await.unwrap(),
            Some("report".to_string())
        );
        assert_eq!(registry.get_task_type(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn assign_marks_intent_without_touching_status() {
        let (registry, _) = registry();
        let info = fresh_task(&registry, None);
        registry.add(&info).await.unwrap();

        let processor = Uuid::new_v4();
        registry.assign(info.task_id, Some(processor)).await.unwrap();
        let pending = registry.get_pending(false).await.unwrap();
        assert_eq!(pending[0].status, TaskStatus::Pending);
        assert_eq!(pending[0].task_processor_id, Some(processor));

        registry.assign(info.task_id, None).await.unwrap();
        let pending = registry.get_pending(false).await.unwrap();
        assert_eq!(pending[0].task_processor_id, None);
    }
}
