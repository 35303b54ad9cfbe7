use std::{collections::VecDeque, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::task::{InvalidTransition, Task, TaskDefinition, TaskOptions};

#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error("Task type '{0}' is already registered")]
    DuplicateTaskType(String),
    #[error("Unknown task type: {0}. Please register it first")]
    UnknownTaskType(String),
}

/// Registry of task types and one FIFO queue per type.
///
/// Queues are created lazily and each is locked independently, so agents
/// pulling different task types never contend.
#[derive(Default)]
pub struct TaskManager {
    task_registry: DashMap<String, Arc<dyn TaskDefinition>>,
    task_queues: DashMap<String, VecDeque<Task>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task_type(
        &self,
        task_type: impl Into<String>,
        definition: impl TaskDefinition + 'static,
    ) -> Result<(), TaskManagerError> {
        self.register_task_definition(task_type, Arc::new(definition))
    }

    pub fn register_task_definition(
        &self,
        task_type: impl Into<String>,
        definition: Arc<dyn TaskDefinition>,
    ) -> Result<(), TaskManagerError> {
        let task_type = task_type.into();
        match self.task_registry.entry(task_type) {
            Entry::Occupied(entry) => Err(TaskManagerError::DuplicateTaskType(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::info!("| task manager | task type '{}' registered", entry.key());
                entry.insert(definition);
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.task_registry.contains_key(task_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types = self
            .task_registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        types.sort();
        types
    }

    pub fn add_task(
        &self,
        task_type: &str,
        payload: Value,
        retries: u32,
    ) -> Result<Uuid, TaskManagerError> {
        self.add_task_with_options(task_type, payload, TaskOptions::default().retries(retries))
    }

    pub fn add_task_with_options(
        &self,
        task_type: &str,
        payload: Value,
        options: TaskOptions,
    ) -> Result<Uuid, TaskManagerError> {
        let definition = self
            .task_registry
            .get(task_type)
            .map(|definition| Arc::clone(definition.value()))
            .ok_or_else(|| TaskManagerError::UnknownTaskType(task_type.to_owned()))?;

        let task = Task::new(task_type, payload, options, definition);
        let task_id = task.task_id();
        tracing::info!(
            "| task manager | task '{}' ({}) queued with payload: {}",
            task_type,
            task_id,
            task.payload()
        );
        self.task_queues
            .entry(task_type.to_owned())
            .or_default()
            .push_back(task);
        Ok(task_id)
    }

    /// Dequeue the oldest pending task for `capability`, already marked in progress.
    /// `None` is the ordinary "nothing to do" answer.
    pub fn get_task(&self, capability: &str) -> Option<Task> {
        let mut task = self.task_queues.get_mut(capability)?.pop_front()?;
        // Queued tasks are always pending.
        if task.mark_in_progress().is_err() {
            tracing::error!("| task manager | queued task {} was already finished", task.task_id());
            return None;
        }
        tracing::info!(
            "| task manager | task '{}' ({}) handed out for capability '{}'",
            task.task_type(),
            task.task_id(),
            capability
        );
        Some(task)
    }

    /// Return a dequeued task that never started to the head of its queue.
    pub(crate) fn requeue(&self, mut task: Task) -> Result<(), InvalidTransition> {
        task.release()?;
        tracing::debug!(
            "| task manager | task '{}' ({}) returned to its queue",
            task.task_type(),
            task.task_id()
        );
        self.task_queues
            .entry(task.task_type().to_owned())
            .or_default()
            .push_front(task);
        Ok(())
    }

    /// Number of tasks waiting in the queue for `task_type`.
    pub fn pending(&self, task_type: &str) -> usize {
        self.task_queues
            .get(task_type)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::task::{TaskContext, TaskError, TaskStatus};

    fn echo(ctx: TaskContext) -> impl Future<Output = Result<Value, TaskError>> + Send + 'static {
        async move { Ok(ctx.payload) }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let manager = TaskManager::new();
        manager.register_task_type("collect", echo).unwrap();

        let err = assert_err!(manager.register_task_type("collect", echo));
        assert!(matches!(err, TaskManagerError::DuplicateTaskType(ref t) if t == "collect"));
        assert_eq!(manager.registered_types(), vec!["collect".to_owned()]);
    }

    #[test]
    fn test_registration_does_not_create_a_queue() {
        let manager = TaskManager::new();
        manager.register_task_type("collect", echo).unwrap();
        assert!(manager.task_queues.is_empty());
    }

    #[test]
    fn test_unknown_task_type_is_rejected() {
        let manager = TaskManager::new();
        let err = assert_err!(manager.add_task("mine", json!({}), 0));
        assert!(matches!(err, TaskManagerError::UnknownTaskType(ref t) if t == "mine"));
        assert_eq!(manager.pending("mine"), 0);
    }

    #[test]
    fn test_tasks_are_handed_out_in_fifo_order() {
        let manager = TaskManager::new();
        manager.register_task_type("collect", echo).unwrap();
        let first = manager.add_task("collect", json!({"point": [10, 20]}), 0).unwrap();
        let second = manager.add_task("collect", json!({"point": [30, 40]}), 0).unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.pending("collect"), 2);

        let task = manager.get_task("collect").unwrap();
        assert_eq!(task.task_id(), first);
        assert_eq!(task.status(), TaskStatus::InProgress);
        assert_eq!(task.payload(), &json!({"point": [10, 20]}));

        let task = manager.get_task("collect").unwrap();
        assert_eq!(task.task_id(), second);

        assert!(manager.get_task("collect").is_none());
    }

    #[test]
    fn test_requeued_task_goes_back_to_the_head() {
        let manager = TaskManager::new();
        manager.register_task_type("collect", echo).unwrap();
        let first = manager.add_task("collect", json!(1), 0).unwrap();
        manager.add_task("collect", json!(2), 0).unwrap();

        let task = manager.get_task("collect").unwrap();
        assert_ok!(manager.requeue(task));

        assert_eq!(manager.pending("collect"), 2);
        let task = manager.get_task("collect").unwrap();
        assert_eq!(task.task_id(), first);
        assert_eq!(task.status(), TaskStatus::InProgress);
    }

    #[test]
    fn test_get_task_for_missing_queue_is_none() {
        let manager = TaskManager::new();
        assert!(manager.get_task("nothing").is_none());
    }

    #[test]
    fn test_queues_are_per_type() {
        let manager = TaskManager::new();
        manager.register_task_type("collect", echo).unwrap();
        manager.register_task_type("scan", echo).unwrap();
        manager.add_task("collect", json!(1), 0).unwrap();

        assert!(manager.get_task("scan").is_none());
        assert_eq!(manager.pending("collect"), 1);
    }

    #[test]
    fn test_options_are_carried_onto_the_task() {
        let manager = TaskManager::new();
        manager.register_task_type("collect", echo).unwrap();
        let options = TaskOptions::default()
            .retries(3)
            .timeout(std::time::Duration::from_secs(5));
        manager.add_task_with_options("collect", json!(null), options).unwrap();

        let task = manager.get_task("collect").unwrap();
        assert_eq!(task.retries(), 3);
        assert_eq!(task.timeout(), Some(std::time::Duration::from_secs(5)));
    }
}
