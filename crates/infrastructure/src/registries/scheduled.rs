//! Scheduled-task definitions and their change notifications.
//!
//! All definitions share one hash: per id, a content blob and a recurrence
//! blob, plus optional companion type tags when the payload serialization
//! cannot self-describe. Every mutation publishes a two-field message
//! `(kind, id)` on the scheduled-tasks channel; listening is opt-in through
//! `set_raise_events`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use taskproc_core::{TaskProcError, TaskProcResult};
use taskproc_domain::{
    keys, MessageBusChannel, ScheduledTask, ScheduledTaskChange, ScheduledTaskRegistry, Store,
};

use crate::subscription::MessageBusSubscription;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

struct ChangeListener {
    subscription: MessageBusSubscription,
    forwarder: JoinHandle<()>,
}

pub struct StoreScheduledTaskRegistry {
    store: Arc<dyn Store>,
    changes: broadcast::Sender<ScheduledTaskChange>,
    listener: AsyncMutex<Option<ChangeListener>>,
}

impl StoreScheduledTaskRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            store,
            changes,
            listener: AsyncMutex::new(None),
        }
    }

    /// Typed change notifications. Only raised while events are enabled.
    pub fn changes(&self) -> broadcast::Receiver<ScheduledTaskChange> {
        self.changes.subscribe()
    }

    /// Turn change listening on or off. Enabling opens a message bus
    /// subscription on the scheduled-tasks channel; disabling closes it.
    pub async fn set_raise_events(&self, enabled: bool) -> TaskProcResult<()> {
        let mut listener = self.listener.lock().await;
        match (enabled, listener.as_ref()) {
            (true, None) => {
                let subscription = MessageBusSubscription::connect(&self.store).await?;
                subscription
                    .subscribe_to_channels(
                        SUBSCRIBE_TIMEOUT,
                        &[MessageBusChannel::ScheduledTasksChanged],
                    )
                    .await?;
                let mut messages = subscription.messages();
                let changes = self.changes.clone();
                let forwarder = tokio::spawn(async move {
                    while let Ok(message) = messages.recv().await {
                        if let Some(change) = parse_change(&message.fields) {
                            let _ = changes.send(change);
                        }
                    }
                });
                *listener = Some(ChangeListener {
                    subscription,
                    forwarder,
                });
            }
            (false, Some(_)) => {
                let ChangeListener {
                    subscription,
                    forwarder,
                } = listener.take().expect("listener present");
                subscription.close().await;
                forwarder.abort();
            }
            _ => {}
        }
        Ok(())
    }

    async fn write(&self, task: &ScheduledTask, change: ScheduledTaskChange) -> TaskProcResult<()> {
        validate(task)?;
        let mut entries = vec![
            (keys::scheduled_task_content(task.id), task.content.clone()),
            (
                keys::scheduled_task_recurrence(task.id),
                task.recurrence_definition.clone(),
            ),
        ];
        if let Some(content_type) = &task.content_type {
            entries.push((
                keys::scheduled_task_content_type(task.id),
                content_type.clone(),
            ));
        }
        if let Some(recurrence_type) = &task.recurrence_type {
            entries.push((
                keys::scheduled_task_recurrence_type(task.id),
                recurrence_type.clone(),
            ));
        }
        self.store
            .hash_set_many(keys::SCHEDULED_TASKS, &entries)
            .await?;
        self.publish_change(change).await
    }

    async fn publish_change(&self, change: ScheduledTaskChange) -> TaskProcResult<()> {
        self.store
            .publish(
                &MessageBusChannel::ScheduledTasksChanged.channel_name(),
                &[change.kind().to_string(), change.id().to_string()],
            )
            .await?;
        debug!(kind = change.kind(), id = %change.id(), "scheduled task change published");
        Ok(())
    }
}

fn validate(task: &ScheduledTask) -> TaskProcResult<()> {
    if task.content.is_empty() {
        return Err(TaskProcError::InvalidArgument(
            "scheduled task content must not be empty".to_string(),
        ));
    }
    if task.recurrence_definition.is_empty() {
        return Err(TaskProcError::InvalidArgument(
            "recurrence definition must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Translate a raw bus message into a typed change. Malformed messages are
/// logged and dropped, never surfaced as errors.
fn parse_change(fields: &[String]) -> Option<ScheduledTaskChange> {
    if fields.len() != 2 {
        warn!(count = fields.len(), "scheduled task change with wrong field count dropped");
        return None;
    }
    let id = match Uuid::parse_str(&fields[1]) {
        Ok(id) => id,
        Err(_) => {
            warn!(id = %fields[1], "scheduled task change with unparsable id dropped");
            return None;
        }
    };
    match fields[0].as_str() {
        "Add" => Some(ScheduledTaskChange::Added(id)),
        "Update" => Some(ScheduledTaskChange::Updated(id)),
        "Delete" => Some(ScheduledTaskChange::Deleted(id)),
        other => {
            warn!(kind = %other, "scheduled task change with unknown kind dropped");
            None
        }
    }
}

fn task_from_fields(id: Uuid, fields: &HashMap<String, String>) -> Option<ScheduledTask> {
    let content = fields.get(&keys::scheduled_task_content(id))?;
    let recurrence = fields.get(&keys::scheduled_task_recurrence(id))?;
    let mut task = ScheduledTask::new(id, content, recurrence);
    task.content_type = fields.get(&keys::scheduled_task_content_type(id)).cloned();
    task.recurrence_type = fields
        .get(&keys::scheduled_task_recurrence_type(id))
        .cloned();
    Some(task)
}

#[async_trait]
impl ScheduledTaskRegistry for StoreScheduledTaskRegistry {
    async fn add(&self, task: &ScheduledTask) -> TaskProcResult<()> {
        self.write(task, ScheduledTaskChange::Added(task.id)).await
    }

    async fn update(&self, task: &ScheduledTask) -> TaskProcResult<()> {
        self.write(task, ScheduledTaskChange::Updated(task.id)).await
    }

    async fn delete(&self, id: Uuid) -> TaskProcResult<()> {
        let fields = vec![
            keys::scheduled_task_content(id),
            keys::scheduled_task_recurrence(id),
            keys::scheduled_task_content_type(id),
            keys::scheduled_task_recurrence_type(id),
        ];
        let removed = self
            .store
            .hash_delete_fields(keys::SCHEDULED_TASKS, &fields)
            .await?;
        if removed == 0 {
            return Err(TaskProcError::ScheduledTaskNotFound { id });
        }
        self.publish_change(ScheduledTaskChange::Deleted(id)).await
    }

    async fn get_by_id(&self, id: Uuid) -> TaskProcResult<Option<ScheduledTask>> {
        let fields = self.store.hash_get_all(keys::SCHEDULED_TASKS).await?;
        Ok(task_from_fields(id, &fields))
    }

    async fn get_all(&self) -> TaskProcResult<Vec<ScheduledTask>> {
        let fields = self.store.hash_get_all(keys::SCHEDULED_TASKS).await?;
        let mut ids: Vec<Uuid> = fields
            .keys()
            .filter_map(|field| {
                let (id, _) = field.split_once('$')?;
                Uuid::parse_str(id).ok()
            })
            .collect();
        ids.sort();
        ids.dedup();

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            match task_from_fields(id, &fields) {
                Some(task) => tasks.push(task),
                // A content blob without its recurrence half (or the other
                // way round) means a torn record; skip it.
                None => warn!(id = %id, "skipping incomplete scheduled task record"),
            }
        }
        Ok(tasks)
    }
}
