//! Configuration flattening.
//!
//! A processor's configuration tree is persisted as one flat string map
//! with `.`-joined, prefix-namespaced keys. Each dynamic child announces
//! itself through a marker field (its own `Type` / `TaskType` key);
//! expansion discovers children by scanning for those markers, never by a
//! count field. This keeps the flat form wire-compatible with existing
//! records.

use std::collections::{BTreeMap, HashMap};

use crate::entities::{
    PollingJobConfiguration, PollingQueueConfiguration, TaskJobConfiguration,
    TaskJobsConfiguration, TaskProcessorConfiguration,
};
use taskproc_core::{TaskProcError, TaskProcResult};

const TASKS: &str = "Tasks";
const POLLING_JOBS: &str = "PollingJobs";
const POLLING_QUEUES: &str = "PollingQueues";

pub fn flatten_configuration(
    prefix: &str,
    config: &TaskProcessorConfiguration,
) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();

    fields.insert(
        format!("{prefix}.{TASKS}.MaxWorkers"),
        config.tasks.max_workers.to_string(),
    );
    for job in &config.tasks.by_task_type {
        let child = format!("{prefix}.{TASKS}.{}", job.task_type);
        fields.insert(format!("{child}.TaskType"), job.task_type.clone());
        fields.insert(format!("{child}.MaxWorkers"), job.max_workers.to_string());
    }

    for job in &config.polling_jobs {
        let child = format!("{prefix}.{POLLING_JOBS}.{}", job.job_type);
        fields.insert(format!("{child}.Type"), job.job_type.clone());
        fields.insert(format!("{child}.IntervalMs"), job.interval_ms.to_string());
        fields.insert(format!("{child}.IsActive"), job.is_active.to_string());
        fields.insert(format!("{child}.IsMaster"), job.is_master.to_string());
    }

    for queue in &config.polling_queues {
        let child = format!("{prefix}.{POLLING_QUEUES}.{}", queue.key);
        fields.insert(format!("{child}.Type"), queue.key.clone());
        fields.insert(format!("{child}.IntervalMs"), queue.interval_ms.to_string());
        fields.insert(format!("{child}.MaxWorkers"), queue.max_workers.to_string());
        fields.insert(format!("{child}.IsActive"), queue.is_active.to_string());
        fields.insert(format!("{child}.IsMaster"), queue.is_master.to_string());
    }

    fields
}

pub fn expand_configuration(
    prefix: &str,
    fields: &HashMap<String, String>,
) -> TaskProcResult<TaskProcessorConfiguration> {
    let parse_u32 = |key: String| -> TaskProcResult<u32> {
        let raw = fields
            .get(&key)
            .ok_or_else(|| malformed(&key, "missing"))?;
        raw.parse().map_err(|_| malformed(&key, raw))
    };
    let parse_u64 = |key: String| -> TaskProcResult<u64> {
        let raw = fields
            .get(&key)
            .ok_or_else(|| malformed(&key, "missing"))?;
        raw.parse().map_err(|_| malformed(&key, raw))
    };
    let parse_bool = |key: String| -> TaskProcResult<bool> {
        let raw = fields
            .get(&key)
            .ok_or_else(|| malformed(&key, "missing"))?;
        raw.parse().map_err(|_| malformed(&key, raw))
    };

    let max_workers = parse_u32(format!("{prefix}.{TASKS}.MaxWorkers"))?;

    // Children are discovered by their marker fields; ordering follows the
    // sorted marker keys so expansion is deterministic.
    let mut by_task_type = Vec::new();
    for task_type in discover(fields, &format!("{prefix}.{TASKS}."), ".TaskType") {
        let child = format!("{prefix}.{TASKS}.{task_type}");
        by_task_type.push(TaskJobConfiguration {
            task_type,
            max_workers: parse_u32(format!("{child}.MaxWorkers"))?,
        });
    }

    let mut polling_jobs = Vec::new();
    for job_type in discover(fields, &format!("{prefix}.{POLLING_JOBS}."), ".Type") {
        let child = format!("{prefix}.{POLLING_JOBS}.{job_type}");
        polling_jobs.push(PollingJobConfiguration {
            job_type,
            interval_ms: parse_u64(format!("{child}.IntervalMs"))?,
            is_active: parse_bool(format!("{child}.IsActive"))?,
            is_master: parse_bool(format!("{child}.IsMaster"))?,
        });
    }

    let mut polling_queues = Vec::new();
    for key in discover(fields, &format!("{prefix}.{POLLING_QUEUES}."), ".Type") {
        let child = format!("{prefix}.{POLLING_QUEUES}.{key}");
        polling_queues.push(PollingQueueConfiguration {
            interval_ms: parse_u64(format!("{child}.IntervalMs"))?,
            max_workers: parse_u32(format!("{child}.MaxWorkers"))?,
            is_active: parse_bool(format!("{child}.IsActive"))?,
            is_master: parse_bool(format!("{child}.IsMaster"))?,
            key,
        });
    }

    Ok(TaskProcessorConfiguration {
        tasks: TaskJobsConfiguration {
            max_workers,
            by_task_type,
        },
        polling_jobs,
        polling_queues,
    })
}

/// Marker values under `prefix` whose key ends with `marker_suffix`, sorted
/// for deterministic expansion.
fn discover(fields: &HashMap<String, String>, prefix: &str, marker_suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = fields
        .iter()
        .filter(|(key, _)| key.starts_with(prefix) && key.ends_with(marker_suffix))
        .map(|(_, value)| value.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn malformed(key: &str, value: &str) -> TaskProcError {
    TaskProcError::Serialization(format!("configuration field '{key}': invalid value '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskProcessorConfiguration {
        TaskProcessorConfiguration {
            tasks: TaskJobsConfiguration {
                max_workers: 8,
                by_task_type: vec![
                    TaskJobConfiguration {
                        task_type: "report".to_string(),
                        max_workers: 2,
                    },
                    TaskJobConfiguration {
                        task_type: "export".to_string(),
                        max_workers: 4,
                    },
                ],
            },
            polling_jobs: vec![PollingJobConfiguration {
                job_type: "cleanup".to_string(),
                interval_ms: 5000,
                is_active: true,
                is_master: true,
            }],
            polling_queues: vec![PollingQueueConfiguration {
                key: "bulk".to_string(),
                interval_ms: 250,
                max_workers: 3,
                is_active: true,
                is_master: false,
            }],
        }
    }

    #[test]
    fn round_trip_preserves_the_tree() {
        let config = sample();
        let flat: HashMap<String, String> =
            flatten_configuration("Configuration", &config).into_iter().collect();
        let mut restored = expand_configuration("Configuration", &flat).unwrap();

        // Expansion orders children by marker key; normalize for comparison.
        restored
            .tasks
            .by_task_type
            .sort_by(|a, b| a.task_type.cmp(&b.task_type));
        let mut expected = config;
        expected
            .tasks
            .by_task_type
            .sort_by(|a, b| a.task_type.cmp(&b.task_type));
        assert_eq!(restored, expected);
    }

    #[test]
    fn children_are_discovered_by_marker_not_count() {
        let config = sample();
        let mut flat: HashMap<String, String> =
            flatten_configuration("C", &config).into_iter().collect();

        // Orphan non-marker keys never introduce children.
        flat.insert("C.PollingJobs.ghost.IntervalMs".to_string(), "1".to_string());
        let restored = expand_configuration("C", &flat).unwrap();
        assert_eq!(restored.polling_jobs.len(), 1);
        assert_eq!(restored.polling_jobs[0].job_type, "cleanup");
    }

    #[test]
    fn empty_tree_flattens_to_global_limits_only() {
        let config = TaskProcessorConfiguration::default();
        let flat = flatten_configuration("C", &config);
        assert_eq!(flat.len(), 1);
        assert!(flat.contains_key("C.Tasks.MaxWorkers"));

        let restored =
            expand_configuration("C", &flat.into_iter().collect()).unwrap();
        assert_eq!(restored, TaskProcessorConfiguration::default());
    }

    #[test]
    fn bad_numeric_field_is_rejected() {
        let config = sample();
        let mut flat: HashMap<String, String> =
            flatten_configuration("C", &config).into_iter().collect();
        flat.insert("C.Tasks.MaxWorkers".to_string(), "many".to_string());
        assert!(expand_configuration("C", &flat).is_err());
    }
}
