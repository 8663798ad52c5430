//! Processor liveness registration and master election.
//!
//! Liveness is passive: each registration is a hash with a TTL renewed by
//! heartbeats, plus membership in a TTL-less id set. A crashed processor is
//! detected only by its record expiring. The master role is one well-known
//! string key under the same TTL, contended with set-if-absent.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use taskproc_core::{TaskProcError, TaskProcResult};
use taskproc_domain::{
    flatten, keys, Store, StoreBatch, TaskProcessorRegistry, TaskProcessorRuntimeInfo,
};

const CONFIGURATION_PREFIX: &str = "Configuration";

pub struct StoreTaskProcessorRegistry {
    store: Arc<dyn Store>,
    expiration: StdMutex<Duration>,
}

impl StoreTaskProcessorRegistry {
    pub fn new(store: Arc<dyn Store>, expiration: Duration) -> TaskProcResult<Self> {
        validate_expiration(expiration)?;
        Ok(Self {
            store,
            expiration: StdMutex::new(expiration),
        })
    }

    pub fn expiration(&self) -> Duration {
        *self.expiration.lock().expect("expiration poisoned")
    }

    pub fn set_expiration(&self, expiration: Duration) -> TaskProcResult<()> {
        validate_expiration(expiration)?;
        *self.expiration.lock().expect("expiration poisoned") = expiration;
        Ok(())
    }

    /// Write the full registration with a fresh TTL and register the set
    /// membership, all-or-nothing.
    async fn write_registration(&self, info: &TaskProcessorRuntimeInfo) -> TaskProcResult<()> {
        let key = keys::task_processor(info.processor_id);
        let mut batch = StoreBatch::new();
        batch.hash_set_many(key.clone(), registration_fields(info));
        batch.expire_in(key, self.expiration());
        batch.set_add(keys::TASK_PROCESSORS, info.processor_id.to_string());
        self.store.run_transaction(batch).await
    }
}

fn validate_expiration(expiration: Duration) -> TaskProcResult<()> {
    if expiration.is_zero() {
        return Err(TaskProcError::InvalidArgument(
            "expiration must be positive".to_string(),
        ));
    }
    Ok(())
}

fn registration_fields(info: &TaskProcessorRuntimeInfo) -> Vec<(String, String)> {
    let mut fields = vec![
        ("Id".to_string(), info.processor_id.to_string()),
        ("MachineName".to_string(), info.machine_name.clone()),
    ];
    fields.extend(flatten::flatten_configuration(
        CONFIGURATION_PREFIX,
        &info.configuration,
    ));
    fields
}

fn registration_from_fields(
    key: &str,
    fields: &std::collections::HashMap<String, String>,
) -> TaskProcResult<TaskProcessorRuntimeInfo> {
    let malformed = |message: String| TaskProcError::MalformedRecord {
        key: key.to_string(),
        message,
    };
    let processor_id = fields
        .get("Id")
        .ok_or_else(|| malformed("missing field 'Id'".to_string()))?;
    let processor_id =
        Uuid::parse_str(processor_id).map_err(|e| malformed(format!("bad Id: {e}")))?;
    let machine_name = fields
        .get("MachineName")
        .ok_or_else(|| malformed("missing field 'MachineName'".to_string()))?
        .clone();
    let configuration = flatten::expand_configuration(CONFIGURATION_PREFIX, fields)?;
    Ok(TaskProcessorRuntimeInfo::new(
        processor_id,
        machine_name,
        configuration,
    ))
}

#[async_trait]
impl TaskProcessorRegistry for StoreTaskProcessorRegistry {
    async fn add(&self, info: &TaskProcessorRuntimeInfo) -> TaskProcResult<()> {
        self.write_registration(info).await?;
        debug!(processor_id = %info.processor_id, machine = %info.machine_name, "processor registered");
        Ok(())
    }

    async fn update(&self, info: &TaskProcessorRuntimeInfo) -> TaskProcResult<()> {
        self.write_registration(info).await
    }

    async fn get_by_id(&self, id: Uuid) -> TaskProcResult<Option<TaskProcessorRuntimeInfo>> {
        let key = keys::task_processor(id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        registration_from_fields(&key, &fields).map(Some)
    }

    async fn get_all(&self) -> TaskProcResult<Vec<TaskProcessorRuntimeInfo>> {
        let members = self.store.set_members(keys::TASK_PROCESSORS).await?;
        let mut batch = StoreBatch::new();
        let mut record_keys = Vec::with_capacity(members.len());
        for member in &members {
            match Uuid::parse_str(member) {
                Ok(id) => {
                    let key = keys::task_processor(id);
                    batch.hash_get_all(key.clone());
                    record_keys.push(key);
                }
                Err(_) => warn!(member = %member, "skipping unparsable processor set member"),
            }
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let replies = self.store.run_pipeline(batch).await?;
        let mut processors = Vec::with_capacity(record_keys.len());
        for (key, reply) in record_keys.into_iter().zip(replies) {
            let fields = reply.into_map();
            // Set membership outlives the TTL'd record; an expired record
            // means a dead processor, not an error.
            if fields.is_empty() {
                continue;
            }
            processors.push(registration_from_fields(&key, &fields)?);
        }
        Ok(processors)
    }

    async fn heartbeat(&self, id: Uuid) -> TaskProcResult<bool> {
        self.store
            .expire_in(&keys::task_processor(id), self.expiration())
            .await
    }

    async fn delete(&self, id: Uuid) -> TaskProcResult<()> {
        let mut batch = StoreBatch::new();
        batch.set_remove(keys::TASK_PROCESSORS, id.to_string());
        batch.delete(keys::task_processor(id));
        self.store.run_transaction(batch).await
    }

    async fn get_master_id(&self) -> TaskProcResult<Option<Uuid>> {
        match self.store.get(keys::MASTER_TASK_PROCESSOR).await? {
            Some(raw) => match Uuid::parse_str(&raw) {
                Ok(id) => Ok(Some(id)),
                Err(_) => {
                    warn!(value = %raw, "unparsable master id, treating as no master");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set_master(&self, id: Uuid) -> TaskProcResult<()> {
        let mut batch = StoreBatch::new();
        batch.set(keys::MASTER_TASK_PROCESSOR, id.to_string());
        batch.expire_in(keys::MASTER_TASK_PROCESSOR, self.expiration());
        self.store.run_transaction(batch).await
    }

    async fn set_master_if_not_exists(&self, id: Uuid) -> TaskProcResult<bool> {
        // Write and TTL go in one command: a crash can never strand a
        // master key that no expiry will ever reclaim.
        let won = self
            .store
            .set_if_absent_with_ttl(
                keys::MASTER_TASK_PROCESSOR,
                &id.to_string(),
                self.expiration(),
            )
            .await?;
        if won {
            debug!(processor_id = %id, "master role acquired");
        }
        Ok(won)
    }

    async fn clear_master(&self) -> TaskProcResult<()> {
        self.store.delete(keys::MASTER_TASK_PROCESSOR).await?;
        Ok(())
    }

    async fn master_heartbeat(&self) -> TaskProcResult<bool> {
        self.store
            .expire_in(keys::MASTER_TASK_PROCESSOR, self.expiration())
            .await
    }
}
