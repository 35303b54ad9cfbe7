use std::{
    any::Any,
    collections::BTreeSet,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{self, BoxFuture},
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::AgentConfig,
    swarm::{Swarm, SwarmError},
    task::{InvalidTransition, Task, TaskContext, TaskDefinition, TaskError},
    transport::{MessageHandler, mailbox_key},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Swarm error: {0}")]
    SwarmError(#[from] SwarmError),
    #[error("Agent '{0}' is not attached to a swarm")]
    Detached(String),
    #[error("Task error: {0}")]
    InvalidTransition(#[from] InvalidTransition),
}

/// Where a message sent by an agent was addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Agent(String),
    Group(String),
    Capability(String),
    Broadcast,
}

/// Passed to the agent's `on_send` handler after a send succeeds.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub from: String,
    pub route: Route,
    pub message: String,
    /// Mailboxes addressed. Broadcasts report 0, the transport does the fan-out.
    pub recipients: usize,
}

pub type SendHandler = Arc<dyn Fn(SentMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// The task an agent is working on right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentTask {
    pub task_id: Uuid,
    pub task_type: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub completed: u64,
    pub failed: u64,
    pub attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
}

/// An agent's own view of its groups and capabilities. Shared with the swarm
/// roster so that both sides change under the same lock.
#[derive(Debug, Default)]
pub(crate) struct Membership {
    pub(crate) groups: BTreeSet<String>,
    pub(crate) capabilities: BTreeSet<String>,
}

/// A named participant that talks through a swarm and executes tasks matching
/// its capabilities, one at a time.
pub struct Agent {
    name: String,
    membership: Arc<Mutex<Membership>>,
    swarm: RwLock<Option<Arc<Swarm>>>,
    on_message: Option<MessageHandler>,
    on_send: Option<SendHandler>,
    poll_interval: Duration,
    task_timeout: Option<Duration>,
    executing: Mutex<()>,
    current_task: StdMutex<Option<CurrentTask>>,
    cancellation: CancellationToken,
    counters: Counters,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout
    }

    pub async fn groups(&self) -> BTreeSet<String> {
        self.membership.lock().await.groups.clone()
    }

    pub async fn capabilities(&self) -> BTreeSet<String> {
        self.membership.lock().await.capabilities.clone()
    }

    pub async fn swarm(&self) -> Option<Arc<Swarm>> {
        self.swarm.read().await.clone()
    }

    pub async fn is_attached(&self) -> bool {
        self.swarm.read().await.is_some()
    }

    pub(crate) fn membership(&self) -> &Arc<Mutex<Membership>> {
        &self.membership
    }

    pub(crate) fn swarm_slot(&self) -> &RwLock<Option<Arc<Swarm>>> {
        &self.swarm
    }

    pub async fn attach(&self, swarm: &Arc<Swarm>) -> Result<(), AgentError> {
        swarm.add_agent(self).await?;
        Ok(())
    }

    pub async fn detach(&self) -> Result<(), AgentError> {
        let swarm = self.attached_swarm().await?;
        swarm.remove_agent(self).await?;
        Ok(())
    }

    /// Join `group`. A detached agent only records it; it is enrolled on attach.
    pub async fn join_group(&self, group: impl Into<String>) -> Result<(), AgentError> {
        let group = group.into();
        match self.swarm().await {
            Some(swarm) => swarm.add_agent_to_group(self, &group).await?,
            None => {
                self.membership.lock().await.groups.insert(group);
            }
        }
        Ok(())
    }

    pub async fn leave_group(&self, group: &str) -> Result<(), AgentError> {
        match self.swarm().await {
            Some(swarm) => swarm.remove_agent_from_group(self, group).await?,
            None => {
                self.membership.lock().await.groups.remove(group);
            }
        }
        Ok(())
    }

    pub async fn add_capability(&self, capability: impl Into<String>) -> Result<(), AgentError> {
        let capability = capability.into();
        match self.swarm().await {
            Some(swarm) => swarm.register_agent_capability(self, &capability).await?,
            None => {
                self.membership.lock().await.capabilities.insert(capability);
            }
        }
        Ok(())
    }

    pub async fn remove_capability(&self, capability: &str) -> Result<(), AgentError> {
        match self.swarm().await {
            Some(swarm) => swarm.unregister_agent_capability(self, capability).await?,
            None => {
                self.membership.lock().await.capabilities.remove(capability);
            }
        }
        Ok(())
    }

    pub async fn send_message(
        &self,
        agent_name: &str,
        message: impl Into<String>,
    ) -> Result<(), AgentError> {
        let swarm = self.attached_swarm().await?;
        let message = message.into();
        swarm.send_to_agent(agent_name, message.clone()).await?;
        self.notify_sent(Route::Agent(agent_name.to_owned()), message, 1)
            .await;
        Ok(())
    }

    pub async fn send_to_group(
        &self,
        group: &str,
        message: impl Into<String>,
    ) -> Result<usize, AgentError> {
        let swarm = self.attached_swarm().await?;
        let message = message.into();
        let recipients = swarm.send_to_group(group, message.clone()).await?;
        self.notify_sent(Route::Group(group.to_owned()), message, recipients)
            .await;
        Ok(recipients)
    }

    pub async fn send_to_capability(
        &self,
        capability: &str,
        message: impl Into<String>,
    ) -> Result<usize, AgentError> {
        let swarm = self.attached_swarm().await?;
        let message = message.into();
        let recipients = swarm.send_to_capability(capability, message.clone()).await?;
        self.notify_sent(Route::Capability(capability.to_owned()), message, recipients)
            .await;
        Ok(recipients)
    }

    pub async fn broadcast(&self, message: impl Into<String>) -> Result<(), AgentError> {
        let swarm = self.attached_swarm().await?;
        let message = message.into();
        swarm.broadcast(message.clone()).await?;
        self.notify_sent(Route::Broadcast, message, 0).await;
        Ok(())
    }

    /// Hand one inbound message to the `on_message` handler, or log it.
    pub async fn receive_message(&self, message: String) {
        dispatch(&self.name, self.on_message.as_ref(), message).await;
    }

    /// Consume this agent's mailbox until the transport stops delivering or the
    /// agent is shut down.
    pub async fn consume_messages(&self) -> Result<(), AgentError> {
        let swarm = self.attached_swarm().await?;
        let mailbox = mailbox_key(&self.name);
        let name = self.name.clone();
        let on_message = self.on_message.clone();
        let handler: MessageHandler = Arc::new(move |message: String| {
            let name = name.clone();
            let on_message = on_message.clone();
            async move { dispatch(&name, on_message.as_ref(), message).await }.boxed()
        });

        tracing::info!("| agent | {} | consuming {}", self.name, mailbox);
        tokio::select! {
            consumed = swarm.consume_messages(&mailbox, handler) => consumed?,
            _ = self.cancellation.cancelled() => {
                tracing::debug!("| agent | {} | stopped consuming {}", self.name, mailbox);
            }
        }
        Ok(())
    }

    /// Pull the first available task matching one of this agent's capabilities
    /// and run it to a final state. `Ok(None)` means nothing was queued.
    pub async fn request_task(&self) -> Result<Option<Task>, AgentError> {
        let swarm = self.attached_swarm().await?;
        if self.cancellation.is_cancelled() {
            return Ok(None);
        }
        let capabilities = self.capabilities().await;
        for capability in &capabilities {
            if let Some(task) = swarm.task_manager().get_task(capability) {
                if self.cancellation.is_cancelled() {
                    swarm.task_manager().requeue(task)?;
                    return Ok(None);
                }
                tracing::info!(
                    "| agent | {} | received task {} ({})",
                    self.name,
                    task.task_id(),
                    task.task_type()
                );
                return self.execute_task(task).await.map(Some);
            }
        }
        tracing::debug!("| agent | {} | no tasks available", self.name);
        Ok(None)
    }

    /// Run `task` until it completes or its retries run out.
    ///
    /// One task runs per agent at a time; a second call waits for the first.
    /// A timeout bounds all attempts together and, like cancellation, is not
    /// retried.
    pub async fn execute_task(&self, mut task: Task) -> Result<Task, AgentError> {
        let _executing = self.executing.lock().await;
        let _clear = ClearCurrentTask(&self.current_task);
        self.run_to_completion(&mut task).await?;
        Ok(task)
    }

    pub async fn current_task(&self) -> Option<CurrentTask> {
        lock_current(&self.current_task).clone()
    }

    pub async fn is_busy(&self) -> bool {
        lock_current(&self.current_task).is_some()
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
        }
    }

    /// Keep requesting tasks until the agent is shut down, sleeping for the
    /// poll interval whenever nothing is queued.
    pub async fn work(&self) -> Result<(), AgentError> {
        tracing::info!("| agent | {} | started working", self.name);
        while !self.cancellation.is_cancelled() {
            if self.request_task().await?.is_some() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancellation.cancelled() => break,
            }
        }
        tracing::info!("| agent | {} | stopped working", self.name);
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Stop `work` and `consume_messages`, and cancel the running task.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    async fn attached_swarm(&self) -> Result<Arc<Swarm>, AgentError> {
        self.swarm()
            .await
            .ok_or_else(|| AgentError::Detached(self.name.clone()))
    }

    async fn notify_sent(&self, route: Route, message: String, recipients: usize) {
        if let Some(on_send) = &self.on_send {
            on_send(SentMessage {
                from: self.name.clone(),
                route,
                message,
                recipients,
            })
            .await;
        }
    }

    async fn run_to_completion(&self, task: &mut Task) -> Result<(), AgentError> {
        let deadline = task
            .timeout()
            .or(self.task_timeout)
            .map(|limit| (Instant::now() + limit, limit));
        let definition = task.definition();

        loop {
            let attempt = task.begin_attempt()?;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            *lock_current(&self.current_task) = Some(CurrentTask {
                task_id: task.task_id(),
                task_type: task.task_type().to_owned(),
                attempt,
            });

            let ctx = TaskContext {
                task_id: task.task_id(),
                task_type: task.task_type().to_owned(),
                payload: task.payload().clone(),
                attempt,
                agent_name: self.name.clone(),
                cancellation: self.cancellation.child_token(),
            };

            match self.run_attempt(definition.as_ref(), ctx, deadline).await {
                Ok(value) => {
                    tracing::info!(
                        "| agent | {} | task {} completed on attempt {}",
                        self.name,
                        task.task_id(),
                        attempt
                    );
                    task.mark_completed(value)?;
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && task.take_retry() => {
                    tracing::warn!(
                        "| agent | {} | task {} attempt {} failed: {}, retries left: {}",
                        self.name,
                        task.task_id(),
                        attempt,
                        e,
                        task.retries()
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "| agent | {} | task {} failed after {} attempt(s): {}",
                        self.name,
                        task.task_id(),
                        attempt,
                        e
                    );
                    task.mark_failed(e.to_string())?;
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        definition: &dyn TaskDefinition,
        ctx: TaskContext,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<Value, TaskError> {
        // Closures may panic before handing back their future, so build it
        // inside the caught region too.
        let attempt = AssertUnwindSafe(future::lazy(move |_| definition.execute(ctx)).flatten())
            .catch_unwind()
            .map(|caught| {
                caught.unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))))
            });
        let bounded = async move {
            match deadline {
                Some((at, limit)) => tokio::time::timeout_at(at, attempt)
                    .await
                    .unwrap_or(Err(TaskError::TimedOut(limit))),
                None => attempt.await,
            }
        };

        // Work is polled at least once before cancellation is observed.
        tokio::select! {
            biased;
            outcome = bounded => outcome,
            _ = self.cancellation.cancelled() => Err(TaskError::Cancelled),
        }
    }
}

/// Clears the agent's current task when execution ends, including when the
/// executing future is dropped part way.
struct ClearCurrentTask<'a>(&'a StdMutex<Option<CurrentTask>>);

impl Drop for ClearCurrentTask<'_> {
    fn drop(&mut self) {
        *lock_current(self.0) = None;
    }
}

fn lock_current(current: &StdMutex<Option<CurrentTask>>) -> MutexGuard<'_, Option<CurrentTask>> {
    current.lock().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("poll_interval", &self.poll_interval)
            .field("task_timeout", &self.task_timeout)
            .finish_non_exhaustive()
    }
}

async fn dispatch(name: &str, on_message: Option<&MessageHandler>, message: String) {
    match on_message {
        Some(handler) => handler(message).await,
        None => tracing::info!("| agent | {} | received message: {}", name, message),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[derive(Default)]
pub struct AgentBuilder {
    name: Option<String>,
    groups: BTreeSet<String>,
    capabilities: BTreeSet<String>,
    on_message: Option<MessageHandler>,
    on_send: Option<SendHandler>,
    poll_interval: Option<Duration>,
    task_timeout: Option<Duration>,
}

impl AgentBuilder {
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut builder = AgentBuilder::default()
            .name(config.name.clone())
            .groups(config.groups.iter().cloned())
            .capabilities(config.capabilities.iter().cloned())
            .poll_interval(Duration::from_millis(config.poll_interval_ms));
        if let Some(timeout_ms) = config.task_timeout_ms {
            builder = builder.task_timeout(Duration::from_millis(timeout_ms));
        }
        builder
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn capabilities(
        mut self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |message: String| handler(message).boxed());
        self.on_message = Some(handler);
        self
    }

    pub fn on_send<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SentMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: SendHandler = Arc::new(move |sent: SentMessage| handler(sent).boxed());
        self.on_send = Some(handler);
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    /// Applies to tasks that do not carry their own timeout.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Agent {
        let name = self
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("Agent-{}", Uuid::new_v4()));
        Agent {
            name,
            membership: Arc::new(Mutex::new(Membership {
                groups: self.groups,
                capabilities: self.capabilities,
            })),
            swarm: RwLock::new(None),
            on_message: self.on_message,
            on_send: self.on_send,
            poll_interval: self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            task_timeout: self.task_timeout,
            executing: Mutex::new(()),
            current_task: StdMutex::new(None),
            cancellation: CancellationToken::new(),
            counters: Counters::default(),
        }
    }
}
