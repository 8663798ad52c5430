//! Explicit task-type registry.
//!
//! Stored records carry a type-tag string. Instead of reflective lookup,
//! every tag is registered here at startup; validating that a string names
//! a task type is a map lookup, and resolving a tag honours the configured
//! [`TypeResolutionPolicy`].

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::warn;

use taskproc_core::{TaskProcError, TaskProcResult, TypeResolutionPolicy};

/// Registration for one task type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTypeRegistration {
    /// Tag persisted in store records.
    pub tag: String,
    /// Human-readable description, used in diagnostics only.
    pub description: Option<String>,
}

#[derive(Debug, Default)]
pub struct TaskTypeRegistry {
    entries: RwLock<HashMap<String, TaskTypeRegistration>>,
    policy: TypeResolutionPolicy,
}

impl TaskTypeRegistry {
    pub fn new(policy: TypeResolutionPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn register(&self, tag: impl Into<String>) -> TaskProcResult<()> {
        self.register_with_description(tag, None::<String>)
    }

    pub fn register_with_description(
        &self,
        tag: impl Into<String>,
        description: Option<impl Into<String>>,
    ) -> TaskProcResult<()> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(TaskProcError::InvalidArgument(
                "task type tag must not be empty".to_string(),
            ));
        }
        let mut entries = self.entries.write().expect("task type registry poisoned");
        entries.insert(
            tag.clone(),
            TaskTypeRegistration {
                tag,
                description: description.map(Into::into),
            },
        );
        Ok(())
    }

    pub fn is_task_type(&self, tag: &str) -> bool {
        self.entries
            .read()
            .expect("task type registry poisoned")
            .contains_key(tag)
    }

    /// Resolve a stored tag.
    ///
    /// Under `Strict` policy an unknown tag is an error; under `Lenient`
    /// it is logged and treated as absent.
    pub fn resolve(&self, tag: &str) -> TaskProcResult<Option<TaskTypeRegistration>> {
        let entries = self.entries.read().expect("task type registry poisoned");
        match entries.get(tag) {
            Some(registration) => Ok(Some(registration.clone())),
            None => match self.policy {
                TypeResolutionPolicy::Strict => Err(TaskProcError::TypeNotFound {
                    tag: tag.to_string(),
                }),
                TypeResolutionPolicy::Lenient => {
                    warn!(tag, "unknown task type tag, treating as absent");
                    Ok(None)
                }
            },
        }
    }

    pub fn registered_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .entries
            .read()
            .expect("task type registry poisoned")
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_a_registry_query() {
        let registry = TaskTypeRegistry::new(TypeResolutionPolicy::Strict);
        registry.register("report").unwrap();
        assert!(registry.is_task_type("report"));
        assert!(!registry.is_task_type("unknown"));
    }

    #[test]
    fn strict_policy_fails_loudly() {
        let registry = TaskTypeRegistry::new(TypeResolutionPolicy::Strict);
        assert!(matches!(
            registry.resolve("ghost"),
            Err(TaskProcError::TypeNotFound { .. })
        ));
    }

    #[test]
    fn lenient_policy_treats_unknown_as_absent() {
        let registry = TaskTypeRegistry::new(TypeResolutionPolicy::Lenient);
        assert_eq!(registry.resolve("ghost").unwrap(), None);
    }

    #[test]
    fn empty_tag_is_rejected() {
        let registry = TaskTypeRegistry::new(TypeResolutionPolicy::Strict);
        assert!(registry.register("").is_err());
    }
}
