use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    logging::LogLevel,
    transport::{
        Transport,
        local::{DEFAULT_QUEUE_CAPACITY, LocalTransport},
    },
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Transport backend '{0}' is not available, enable the '{0}' feature")]
    BackendUnavailable(&'static str),
}

/// Everything needed to stand up a swarm and its agents.
///
/// ```json
/// {
///   "name": "SpaceCom",
///   "backend": { "type": "local", "queue_capacity": 256 },
///   "log_level": "debug",
///   "agents": [{ "name": "Agent1", "groups": ["main"], "capabilities": ["collect"] }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub name: String,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl SwarmConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: BackendConfig::default(),
            log_level: LogLevel::default(),
            agents: Vec::new(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Local {
        #[serde(default = "default_queue_capacity")]
        queue_capacity: usize,
    },
    Amqp {
        url: String,
        #[serde(default = "default_exchange")]
        exchange: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl BackendConfig {
    pub fn build_transport(&self) -> Result<Arc<dyn Transport>, ConfigError> {
        match self {
            BackendConfig::Local { queue_capacity } => {
                Ok(Arc::new(LocalTransport::with_capacity(*queue_capacity)))
            }
            #[cfg(feature = "amqp")]
            BackendConfig::Amqp { url, exchange } => Ok(Arc::new(
                crate::transport::amqp::AmqpTransport::with_exchange(url, exchange),
            )),
            #[cfg(not(feature = "amqp"))]
            BackendConfig::Amqp { .. } => Err(ConfigError::BackendUnavailable("amqp")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            groups: Vec::new(),
            capabilities: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            task_timeout_ms: None,
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_exchange() -> String {
    "swarm".to_owned()
}

fn default_poll_interval_ms() -> u64 {
    100
}
