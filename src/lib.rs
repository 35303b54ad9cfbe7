//! Agentex coordinates a swarm of autonomous agents.
//!
//! A [`Swarm`] routes messages to agents by name, by group or by capability over a
//! pluggable [`Transport`], and hands out queued [`Task`]s to agents whose
//! capabilities match the task type. Agents execute one task at a time with bounded
//! retries, an optional timeout and cooperative cancellation.
pub mod agent;
pub mod config;
pub mod logging;
pub mod swarm;
pub mod task;
pub mod task_manager;
pub mod transport;

pub use agent::{Agent, AgentBuilder, AgentError, AgentStats, Route, SentMessage};
pub use config::{AgentConfig, BackendConfig, SwarmConfig};
pub use swarm::{Swarm, SwarmError};
pub use task::{Task, TaskContext, TaskError, TaskOptions, TaskResult, TaskStatus};
pub use task_manager::TaskManager;
pub use transport::{Transport, local::LocalTransport};
