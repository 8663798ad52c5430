use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registration record for a task processor, kept alive by heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProcessorRuntimeInfo {
    pub processor_id: Uuid,
    pub machine_name: String,
    pub configuration: TaskProcessorConfiguration,
}

impl TaskProcessorRuntimeInfo {
    pub fn new(
        processor_id: Uuid,
        machine_name: impl Into<String>,
        configuration: TaskProcessorConfiguration,
    ) -> Self {
        Self {
            processor_id,
            machine_name: machine_name.into(),
            configuration,
        }
    }

    /// Registration for the local machine, resolving the machine name from
    /// the OS.
    pub fn for_local_machine(configuration: TaskProcessorConfiguration) -> Self {
        let machine_name = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::new(Uuid::new_v4(), machine_name, configuration)
    }
}

/// Variable-shape configuration tree carried by each processor
/// registration. Serialized through the flattening in [`crate::flatten`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskProcessorConfiguration {
    pub tasks: TaskJobsConfiguration,
    pub polling_jobs: Vec<PollingJobConfiguration>,
    pub polling_queues: Vec<PollingQueueConfiguration>,
}

impl TaskProcessorConfiguration {
    pub fn polling_job(&self, job_type: &str) -> Option<&PollingJobConfiguration> {
        self.polling_jobs.iter().find(|job| job.job_type == job_type)
    }

    pub fn polling_queue(&self, key: &str) -> Option<&PollingQueueConfiguration> {
        self.polling_queues.iter().find(|queue| queue.key == key)
    }
}

/// Global task-job limits plus per-task-type overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskJobsConfiguration {
    pub max_workers: u32,
    pub by_task_type: Vec<TaskJobConfiguration>,
}

impl Default for TaskJobsConfiguration {
    fn default() -> Self {
        Self {
            max_workers: 1,
            by_task_type: Vec::new(),
        }
    }
}

impl TaskJobsConfiguration {
    pub fn for_task_type(&self, task_type: &str) -> Option<&TaskJobConfiguration> {
        self.by_task_type
            .iter()
            .find(|job| job.task_type == task_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskJobConfiguration {
    pub task_type: String,
    pub max_workers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingJobConfiguration {
    pub job_type: String,
    pub interval_ms: u64,
    pub is_active: bool,
    pub is_master: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingQueueConfiguration {
    pub key: String,
    pub interval_ms: u64,
    pub max_workers: u32,
    pub is_active: bool,
    pub is_master: bool,
}
