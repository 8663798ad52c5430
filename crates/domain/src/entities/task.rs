use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskproc_core::{TaskProcError, TaskProcResult};

/// Lifecycle status of a task.
///
/// A live record exists in the store if and only if the status is `Pending`
/// or `InProgress`; every other status lives in the archive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Canceled,
    Failed,
    Success,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::InProgress => "InProgress",
            TaskStatus::Canceled => "Canceled",
            TaskStatus::Failed => "Failed",
            TaskStatus::Success => "Success",
        }
    }

    pub fn parse(s: &str) -> TaskProcResult<Self> {
        match s {
            "Pending" => Ok(TaskStatus::Pending),
            "InProgress" => Ok(TaskStatus::InProgress),
            "Canceled" => Ok(TaskStatus::Canceled),
            "Failed" => Ok(TaskStatus::Failed),
            "Success" => Ok(TaskStatus::Success),
            _ => Err(TaskProcError::InvalidArgument(format!(
                "invalid task status: {s}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Canceled | TaskStatus::Failed | TaskStatus::Success
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "Low",
            TaskPriority::Normal => "Normal",
            TaskPriority::High => "High",
        }
    }

    pub fn parse(s: &str) -> TaskProcResult<Self> {
        match s {
            "Low" => Ok(TaskPriority::Low),
            "Normal" => Ok(TaskPriority::Normal),
            "High" => Ok(TaskPriority::High),
            _ => Err(TaskProcError::InvalidArgument(format!(
                "invalid task priority: {s}"
            ))),
        }
    }
}

/// Mutable lifecycle record for a task.
///
/// The task payload itself is opaque to the coordination layer; everything
/// needed to track ownership and progress lives here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRuntimeInfo {
    pub task_id: Uuid,
    pub task_type: String,
    pub submitted_utc: DateTime<Utc>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Named polling queue this task is leased through, if any. `None`
    /// means the task goes through the global pending list.
    pub polling_queue: Option<String>,
    pub task_processor_id: Option<Uuid>,
    pub started_utc: Option<DateTime<Utc>>,
    pub percentage: f64,
    pub canceled_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskRuntimeInfo {
    /// Transient, unpersisted record for a freshly submitted task.
    pub fn new(
        task_id: Uuid,
        task_type: impl Into<String>,
        submitted_utc: DateTime<Utc>,
        priority: TaskPriority,
        polling_queue: Option<String>,
    ) -> Self {
        Self {
            task_id,
            task_type: task_type.into(),
            submitted_utc,
            status: TaskStatus::Pending,
            priority,
            polling_queue,
            task_processor_id: None,
            started_utc: None,
            percentage: 0.0,
            canceled_utc: None,
            completed_utc: None,
            error: None,
        }
    }

    /// Whether the record still satisfies the fresh-record invariant a
    /// caller must uphold before the first persist.
    pub fn is_fresh(&self) -> bool {
        self.status == TaskStatus::Pending
            && self.task_processor_id.is_none()
            && self.percentage == 0.0
            && self.started_utc.is_none()
            && self.canceled_utc.is_none()
            && self.completed_utc.is_none()
            && self.error.is_none()
    }

    /// Serialize into a flat field map for hash storage.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("Id".to_string(), self.task_id.to_string()),
            ("TaskType".to_string(), self.task_type.clone()),
            ("SubmittedUtc".to_string(), self.submitted_utc.to_rfc3339()),
            ("Status".to_string(), self.status.as_str().to_string()),
            ("Priority".to_string(), self.priority.as_str().to_string()),
            ("Percentage".to_string(), self.percentage.to_string()),
        ];
        if let Some(queue) = &self.polling_queue {
            fields.push(("PollingQueue".to_string(), queue.clone()));
        }
        if let Some(id) = self.task_processor_id {
            fields.push(("TaskProcessorId".to_string(), id.to_string()));
        }
        if let Some(t) = self.started_utc {
            fields.push(("StartedUtc".to_string(), t.to_rfc3339()));
        }
        if let Some(t) = self.canceled_utc {
            fields.push(("CanceledUtc".to_string(), t.to_rfc3339()));
        }
        if let Some(t) = self.completed_utc {
            fields.push(("CompletedUtc".to_string(), t.to_rfc3339()));
        }
        if let Some(error) = &self.error {
            fields.push(("Error".to_string(), error.clone()));
        }
        fields
    }

    /// Rebuild a record from its hash fields. `key` is only used for error
    /// reporting.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> TaskProcResult<Self> {
        let required = |name: &str| -> TaskProcResult<&String> {
            fields.get(name).ok_or_else(|| TaskProcError::MalformedRecord {
                key: key.to_string(),
                message: format!("missing field '{name}'"),
            })
        };
        let malformed = |message: String| TaskProcError::MalformedRecord {
            key: key.to_string(),
            message,
        };

        let task_id = Uuid::parse_str(required("Id")?)
            .map_err(|e| malformed(format!("bad Id: {e}")))?;
        let submitted_utc = DateTime::parse_from_rfc3339(required("SubmittedUtc")?)
            .map_err(|e| malformed(format!("bad SubmittedUtc: {e}")))?
            .with_timezone(&Utc);
        let status = TaskStatus::parse(required("Status")?)
            .map_err(|e| malformed(e.to_string()))?;
        let priority = TaskPriority::parse(required("Priority")?)
            .map_err(|e| malformed(e.to_string()))?;
        let percentage = required("Percentage")?
            .parse::<f64>()
            .map_err(|e| malformed(format!("bad Percentage: {e}")))?;

        let parse_time = |name: &str| -> TaskProcResult<Option<DateTime<Utc>>> {
            fields
                .get(name)
                .map(|raw| {
                    DateTime::parse_from_rfc3339(raw)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| malformed(format!("bad {name}: {e}")))
                })
                .transpose()
        };
        let task_processor_id = fields
            .get("TaskProcessorId")
            .map(|raw| {
                Uuid::parse_str(raw).map_err(|e| malformed(format!("bad TaskProcessorId: {e}")))
            })
            .transpose()?;

        Ok(Self {
            task_id,
            task_type: required("TaskType")?.clone(),
            submitted_utc,
            status,
            priority,
            polling_queue: fields.get("PollingQueue").cloned(),
            task_processor_id,
            started_utc: parse_time("StartedUtc")?,
            percentage,
            canceled_utc: parse_time("CanceledUtc")?,
            completed_utc: parse_time("CompletedUtc")?,
            error: fields.get("Error").cloned(),
        })
    }
}
