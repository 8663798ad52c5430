use serde::{Deserialize, Serialize};

use taskproc_core::{TaskProcError, TaskProcResult};

/// Logical message-bus channels, each mapping 1:1 to a physical pub/sub
/// channel name.
///
/// The private per-subscription control channel is deliberately not part of
/// this enumeration; it is never surfaced to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageBusChannel {
    None,
    TaskSubmitted,
    TaskCanceled,
    MasterChanged,
    ScheduledTasksChanged,
}

/// Prefix shared by every physical channel name; kept verbatim for wire
/// compatibility with existing deployments.
pub const CHANNEL_NAME_PREFIX: &str = "Radoslav$TaskProcessor";

impl MessageBusChannel {
    pub fn channel_name(&self) -> String {
        let suffix = match self {
            MessageBusChannel::None => "None",
            MessageBusChannel::TaskSubmitted => "TaskSubmitted",
            MessageBusChannel::TaskCanceled => "TaskCanceled",
            MessageBusChannel::MasterChanged => "MasterChanged",
            MessageBusChannel::ScheduledTasksChanged => "ScheduledTasks",
        };
        format!("{CHANNEL_NAME_PREFIX}${suffix}")
    }

    pub fn from_channel_name(name: &str) -> TaskProcResult<Self> {
        match name.strip_prefix(CHANNEL_NAME_PREFIX).and_then(|s| s.strip_prefix('$')) {
            Some("None") => Ok(MessageBusChannel::None),
            Some("TaskSubmitted") => Ok(MessageBusChannel::TaskSubmitted),
            Some("TaskCanceled") => Ok(MessageBusChannel::TaskCanceled),
            Some("MasterChanged") => Ok(MessageBusChannel::MasterChanged),
            Some("ScheduledTasks") => Ok(MessageBusChannel::ScheduledTasksChanged),
            _ => Err(TaskProcError::InvalidArgument(format!(
                "unknown message bus channel: {name}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduled_tasks_channel_name_is_wire_compatible() {
        assert_eq!(
            MessageBusChannel::ScheduledTasksChanged.channel_name(),
            "Radoslav$TaskProcessor$ScheduledTasks"
        );
    }

    #[test]
    fn channel_names_round_trip() {
        for channel in [
            MessageBusChannel::None,
            MessageBusChannel::TaskSubmitted,
            MessageBusChannel::TaskCanceled,
            MessageBusChannel::MasterChanged,
            MessageBusChannel::ScheduledTasksChanged,
        ] {
            let name = channel.channel_name();
            assert_eq!(MessageBusChannel::from_channel_name(&name).unwrap(), channel);
        }
    }
}
