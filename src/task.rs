use std::{fmt, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.pad(status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Success(Value),
    Failure(String),
}

/// Why a single attempt of a task's work did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("Task timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Task was cancelled")]
    Cancelled,
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        TaskError::Failed(reason.to_string())
    }

    /// Timeouts and cancellation end the task; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Failed(_) | TaskError::Panicked(_))
    }
}

#[derive(Debug, Error)]
#[error("Task {task_id}: illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub task_id: Uuid,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub retries: u32,
    pub timeout: Option<Duration>,
}

impl TaskOptions {
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Everything a task definition gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_type: String,
    pub payload: Value,
    /// 1-based.
    pub attempt: u32,
    pub agent_name: String,
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fails with [`TaskError::Cancelled`] once the executing agent shuts down.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The executable behaviour behind a task type.
pub trait TaskDefinition: Send + Sync {
    fn execute(&self, ctx: TaskContext) -> BoxFuture<'_, Result<Value, TaskError>>;
}

impl<F, Fut> TaskDefinition for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    fn execute(&self, ctx: TaskContext) -> BoxFuture<'_, Result<Value, TaskError>> {
        Box::pin(self(ctx))
    }
}

/// A unit of work. Only the task manager (on dequeue) and the executing agent
/// move it through its lifecycle; `completed` and `failed` are final.
#[derive(Clone, Serialize)]
pub struct Task {
    task_id: Uuid,
    task_type: String,
    payload: Value,
    retries: u32,
    status: TaskStatus,
    result: Option<TaskResult>,
    attempts: u32,
    timeout: Option<Duration>,
    created_at: DateTime<Local>,
    started_at: Option<DateTime<Local>>,
    finished_at: Option<DateTime<Local>>,
    #[serde(skip)]
    definition: Arc<dyn TaskDefinition>,
}

impl Task {
    pub(crate) fn new(
        task_type: impl Into<String>,
        payload: Value,
        options: TaskOptions,
        definition: Arc<dyn TaskDefinition>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            retries: options.retries,
            status: TaskStatus::Pending,
            result: None,
            attempts: 0,
            timeout: options.timeout,
            created_at: Local::now(),
            started_at: None,
            finished_at: None,
            definition,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Remaining retry budget.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    /// Number of times the work has been started.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Local>> {
        self.finished_at
    }

    pub(crate) fn definition(&self) -> Arc<dyn TaskDefinition> {
        Arc::clone(&self.definition)
    }

    pub(crate) fn mark_in_progress(&mut self) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(self.illegal(TaskStatus::InProgress));
        }
        self.status = TaskStatus::InProgress;
        self.started_at.get_or_insert_with(Local::now);
        Ok(())
    }

    /// Puts a dequeued task whose work never started back to pending.
    pub(crate) fn release(&mut self) -> Result<(), InvalidTransition> {
        if self.status != TaskStatus::InProgress || self.attempts > 0 {
            return Err(self.illegal(TaskStatus::Pending));
        }
        self.status = TaskStatus::Pending;
        self.started_at = None;
        Ok(())
    }

    /// Marks the task in progress and counts a new attempt, returning its number.
    pub(crate) fn begin_attempt(&mut self) -> Result<u32, InvalidTransition> {
        self.mark_in_progress()?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Spends one retry if any are left.
    pub(crate) fn take_retry(&mut self) -> bool {
        if self.retries == 0 {
            return false;
        }
        self.retries -= 1;
        true
    }

    pub(crate) fn mark_completed(&mut self, value: Value) -> Result<(), InvalidTransition> {
        self.finish(TaskStatus::Completed, TaskResult::Success(value))
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.finish(TaskStatus::Failed, TaskResult::Failure(reason.into()))
    }

    fn finish(&mut self, status: TaskStatus, result: TaskResult) -> Result<(), InvalidTransition> {
        if self.status != TaskStatus::InProgress {
            return Err(self.illegal(status));
        }
        self.status = status;
        self.result = Some(result);
        self.finished_at = Some(Local::now());
        Ok(())
    }

    fn illegal(&self, to: TaskStatus) -> InvalidTransition {
        InvalidTransition {
            task_id: self.task_id,
            from: self.status,
            to,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("task_type", &self.task_type)
            .field("payload", &self.payload)
            .field("retries", &self.retries)
            .field("status", &self.status)
            .field("result", &self.result)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Task {} - {} - {}>", self.task_id, self.task_type, self.status)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn noop() -> Arc<dyn TaskDefinition> {
        Arc::new(|_ctx: TaskContext| async { Ok::<_, TaskError>(Value::Null) })
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new(
            "collect",
            json!({"point": [10, 20]}),
            TaskOptions::default().retries(2),
            noop(),
        );
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.retries(), 2);
        assert_eq!(task.attempts(), 0);
        assert!(task.result().is_none());
        assert!(task.started_at().is_none());
    }

    #[test]
    fn test_lifecycle_success() {
        let mut task = Task::new("collect", Value::Null, TaskOptions::default(), noop());
        assert_eq!(task.begin_attempt().unwrap(), 1);
        assert_eq!(task.status(), TaskStatus::InProgress);

        task.mark_completed(json!("done")).unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result(), Some(&TaskResult::Success(json!("done"))));
        assert!(task.finished_at().is_some());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut task = Task::new("collect", Value::Null, TaskOptions::default(), noop());
        task.mark_in_progress().unwrap();
        task.mark_failed("boom").unwrap();

        assert!(task.mark_in_progress().is_err());
        assert!(task.mark_completed(Value::Null).is_err());
        let err = task.mark_failed("again").unwrap_err();
        assert_eq!(err.from, TaskStatus::Failed);
        assert_eq!(task.result(), Some(&TaskResult::Failure("boom".to_owned())));
    }

    #[test]
    fn test_cannot_finish_a_pending_task() {
        let mut task = Task::new("collect", Value::Null, TaskOptions::default(), noop());
        assert!(task.mark_completed(Value::Null).is_err());
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn test_release_only_before_first_attempt() {
        let mut task = Task::new("collect", Value::Null, TaskOptions::default(), noop());
        assert!(task.release().is_err());

        task.mark_in_progress().unwrap();
        task.release().unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.started_at().is_none());

        task.begin_attempt().unwrap();
        assert!(task.release().is_err());
        assert_eq!(task.status(), TaskStatus::InProgress);
    }

    #[test]
    fn test_take_retry_spends_budget() {
        let options = TaskOptions::default().retries(1);
        let mut task = Task::new("collect", Value::Null, options, noop());
        assert!(task.take_retry());
        assert_eq!(task.retries(), 0);
        assert!(!task.take_retry());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let status = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(status, "\"in_progress\"");
        let task = Task::new("collect", json!({"k": 1}), TaskOptions::default(), noop());
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["task_type"], "collect");
    }

    #[test]
    fn test_only_plain_failures_are_retryable() {
        assert!(TaskError::failed("x").is_retryable());
        assert!(TaskError::Panicked("x".into()).is_retryable());
        assert!(!TaskError::Cancelled.is_retryable());
        assert!(!TaskError::TimedOut(Duration::from_secs(1)).is_retryable());
    }
}
