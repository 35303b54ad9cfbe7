use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    agent::{Agent, AgentBuilder, Membership},
    config::{ConfigError, SwarmConfig},
    task_manager::{TaskManager, TaskManagerError},
    transport::{BROADCAST_KEY, MessageHandler, Transport, TransportError, mailbox_key},
};

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),
    #[error("TaskManager error: {0}")]
    TaskManagerError(#[from] TaskManagerError),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Agent's name should be unique, duplicate name: {0}")]
    DuplicateAgent(String),
    #[error("Agent '{0}' is not attached to this swarm")]
    AgentNotAttached(String),
    #[error("Agent '{agent}' is already attached to swarm '{swarm}'")]
    AlreadyAttached { agent: String, swarm: String },
    #[error("Delivered to {delivered} of {recipients} recipients: {source}")]
    PartialDelivery {
        delivered: usize,
        recipients: usize,
        source: TransportError,
    },
}

/// bucket name -> member agent names
type Registry = DashMap<String, BTreeSet<String>>;

/// Routes messages by agent name, group or capability and owns the task manager.
///
/// Group and capability buckets are locked per bucket. Every membership change
/// also holds the agent's own membership lock, so an agent is either listed on
/// both sides or on neither.
pub struct Swarm {
    name: String,
    transport: Arc<dyn Transport>,
    task_manager: TaskManager,
    agents: DashMap<String, Arc<Mutex<Membership>>>,
    groups: Registry,
    capabilities: Registry,
}

impl Swarm {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            transport,
            task_manager: TaskManager::new(),
            agents: DashMap::new(),
            groups: DashMap::new(),
            capabilities: DashMap::new(),
        })
    }

    pub fn from_config(config: &SwarmConfig) -> Result<Arc<Self>, SwarmError> {
        let transport = config.backend.build_transport()?;
        Ok(Self::new(config.name.clone(), transport))
    }

    /// Build and attach every agent declared in `config`.
    pub async fn spawn_agents(
        self: &Arc<Self>,
        config: &SwarmConfig,
    ) -> Result<Vec<Arc<Agent>>, SwarmError> {
        let mut agents = Vec::with_capacity(config.agents.len());
        for agent_config in &config.agents {
            let agent = Arc::new(AgentBuilder::from_config(agent_config).build());
            self.add_agent(&agent).await?;
            agents.push(agent);
        }
        Ok(agents)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub async fn connect(&self) -> Result<(), SwarmError> {
        self.transport.connect().await?;
        tracing::info!("| swarm | {} | connected", self.name);
        Ok(())
    }

    pub async fn close(&self) -> Result<(), SwarmError> {
        self.transport.close().await?;
        tracing::info!("| swarm | {} | closed", self.name);
        Ok(())
    }

    /// Queue a task with no retries.
    pub fn assign_task(&self, task_type: &str, payload: Value) -> Result<Uuid, SwarmError> {
        Ok(self.task_manager.add_task(task_type, payload, 0)?)
    }

    /// Attach `agent` and enroll it under all of its groups and capabilities.
    /// Re-adding an agent that is already attached only re-enrolls it.
    pub async fn add_agent(self: &Arc<Self>, agent: &Agent) -> Result<(), SwarmError> {
        {
            let mut slot = agent.swarm_slot().write().await;
            if let Some(current) = slot.as_ref() {
                if !Arc::ptr_eq(current, self) {
                    return Err(SwarmError::AlreadyAttached {
                        agent: agent.name().to_owned(),
                        swarm: current.name().to_owned(),
                    });
                }
            }

            let membership = agent.membership().lock().await;
            match self.agents.entry(agent.name().to_owned()) {
                Entry::Occupied(entry) if !Arc::ptr_eq(entry.get(), agent.membership()) => {
                    return Err(SwarmError::DuplicateAgent(agent.name().to_owned()));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(agent.membership()));
                }
            }
            for group in &membership.groups {
                enroll(&self.groups, group, agent.name());
            }
            for capability in &membership.capabilities {
                enroll(&self.capabilities, capability, agent.name());
            }
            *slot = Some(Arc::clone(self));
        }

        if let Err(e) = self
            .transport
            .bind(&mailbox_key(agent.name()), BROADCAST_KEY)
            .await
        {
            self.remove_agent(agent).await?;
            return Err(e.into());
        }
        tracing::info!("| swarm | {} | agent '{}' attached", self.name, agent.name());
        Ok(())
    }

    /// Detach `agent`, removing it from every group and capability bucket.
    /// Returns `false` if it was not attached here.
    pub async fn remove_agent(&self, agent: &Agent) -> Result<bool, SwarmError> {
        {
            let mut slot = agent.swarm_slot().write().await;
            let membership = agent.membership().lock().await;
            let removed = self
                .agents
                .remove_if(agent.name(), |_, registered| {
                    Arc::ptr_eq(registered, agent.membership())
                })
                .is_some();
            if !removed {
                tracing::warn!(
                    "| swarm | {} | agent '{}' is not attached, nothing to remove",
                    self.name,
                    agent.name()
                );
                return Ok(false);
            }

            for group in &membership.groups {
                withdraw(&self.groups, group, agent.name());
            }
            for capability in &membership.capabilities {
                withdraw(&self.capabilities, capability, agent.name());
            }
            if slot
                .as_ref()
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self))
            {
                *slot = None;
            }
        }

        self.transport
            .unbind(&mailbox_key(agent.name()), BROADCAST_KEY)
            .await?;
        tracing::info!("| swarm | {} | agent '{}' detached", self.name, agent.name());
        Ok(true)
    }

    pub async fn add_agent_to_group(&self, agent: &Agent, group: &str) -> Result<(), SwarmError> {
        let mut membership = agent.membership().lock().await;
        self.ensure_attached(agent)?;
        enroll(&self.groups, group, agent.name());
        membership.groups.insert(group.to_owned());
        Ok(())
    }

    /// Idempotent: leaving a group the agent is not in is a no-op.
    pub async fn remove_agent_from_group(
        &self,
        agent: &Agent,
        group: &str,
    ) -> Result<(), SwarmError> {
        let mut membership = agent.membership().lock().await;
        self.ensure_attached(agent)?;
        withdraw(&self.groups, group, agent.name());
        membership.groups.remove(group);
        Ok(())
    }

    pub async fn register_agent_capability(
        &self,
        agent: &Agent,
        capability: &str,
    ) -> Result<(), SwarmError> {
        let mut membership = agent.membership().lock().await;
        self.ensure_attached(agent)?;
        enroll(&self.capabilities, capability, agent.name());
        membership.capabilities.insert(capability.to_owned());
        Ok(())
    }

    pub async fn unregister_agent_capability(
        &self,
        agent: &Agent,
        capability: &str,
    ) -> Result<(), SwarmError> {
        let mut membership = agent.membership().lock().await;
        self.ensure_attached(agent)?;
        withdraw(&self.capabilities, capability, agent.name());
        membership.capabilities.remove(capability);
        Ok(())
    }

    /// Publish to the agent's mailbox. Unknown names are logged, not rejected:
    /// the mailbox is created on demand and waits for an agent of that name.
    pub async fn send_to_agent(
        &self,
        agent_name: &str,
        message: impl Into<String>,
    ) -> Result<(), SwarmError> {
        if !self.agents.contains_key(agent_name) {
            tracing::warn!(
                "| swarm | {} | no agent named '{}', message left in its mailbox",
                self.name,
                agent_name
            );
        }
        self.transport
            .publish(&mailbox_key(agent_name), message.into())
            .await?;
        Ok(())
    }

    pub async fn broadcast(&self, message: impl Into<String>) -> Result<(), SwarmError> {
        self.transport.publish(BROADCAST_KEY, message.into()).await?;
        Ok(())
    }

    /// Send to every current member of `group`, returning how many were addressed.
    pub async fn send_to_group(
        &self,
        group: &str,
        message: impl Into<String>,
    ) -> Result<usize, SwarmError> {
        let Some(members) = snapshot(&self.groups, group) else {
            tracing::warn!("| swarm | {} | group '{}' has no agents", self.name, group);
            return Ok(0);
        };
        self.fan_out(&members, message.into()).await
    }

    /// Send to every agent currently registered under `capability`.
    pub async fn send_to_capability(
        &self,
        capability: &str,
        message: impl Into<String>,
    ) -> Result<usize, SwarmError> {
        let Some(members) = snapshot(&self.capabilities, capability) else {
            tracing::warn!(
                "| swarm | {} | no agents found with capability '{}'",
                self.name,
                capability
            );
            return Ok(0);
        };
        self.fan_out(&members, message.into()).await
    }

    pub async fn consume_messages(
        &self,
        queue_name: &str,
        handler: MessageHandler,
    ) -> Result<(), SwarmError> {
        self.transport.consume(queue_name, handler).await?;
        Ok(())
    }

    pub fn contains_agent(&self, agent_name: &str) -> bool {
        self.agents.contains_key(agent_name)
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names = self
            .agents
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn groups(&self) -> BTreeMap<String, BTreeSet<String>> {
        collect_registry(&self.groups)
    }

    pub fn capabilities(&self) -> BTreeMap<String, BTreeSet<String>> {
        collect_registry(&self.capabilities)
    }

    pub fn group_members(&self, group: &str) -> BTreeSet<String> {
        self.groups
            .get(group)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    pub fn capability_members(&self, capability: &str) -> BTreeSet<String> {
        self.capabilities
            .get(capability)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    /// Every member gets its copy even if an earlier mailbox rejects one.
    async fn fan_out(&self, members: &[String], message: String) -> Result<usize, SwarmError> {
        let mut delivered = 0;
        let mut first_error = None;
        for member in members {
            match self
                .transport
                .publish(&mailbox_key(member), message.clone())
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        "| swarm | {} | delivery to '{}' failed: {}",
                        self.name,
                        member,
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            None => Ok(delivered),
            Some(source) => Err(SwarmError::PartialDelivery {
                delivered,
                recipients: members.len(),
                source,
            }),
        }
    }

    fn ensure_attached(&self, agent: &Agent) -> Result<(), SwarmError> {
        match self.agents.get(agent.name()) {
            Some(registered) if Arc::ptr_eq(registered.value(), agent.membership()) => Ok(()),
            _ => Err(SwarmError::AgentNotAttached(agent.name().to_owned())),
        }
    }
}

fn enroll(registry: &Registry, key: &str, agent_name: &str) {
    registry
        .entry(key.to_owned())
        .or_default()
        .insert(agent_name.to_owned());
}

/// Remove `agent_name` from the bucket, dropping the bucket once it is empty.
fn withdraw(registry: &Registry, key: &str, agent_name: &str) {
    if let Entry::Occupied(mut bucket) = registry.entry(key.to_owned()) {
        bucket.get_mut().remove(agent_name);
        if bucket.get().is_empty() {
            bucket.remove();
        }
    }
}

fn snapshot(registry: &Registry, key: &str) -> Option<Vec<String>> {
    registry
        .get(key)
        .map(|members| members.iter().cloned().collect::<Vec<_>>())
        .filter(|members| !members.is_empty())
}

fn collect_registry(registry: &Registry) -> BTreeMap<String, BTreeSet<String>> {
    registry
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalTransport;

    fn local_swarm() -> (Arc<Swarm>, Arc<LocalTransport>) {
        let transport = Arc::new(LocalTransport::new());
        let swarm = Swarm::new("TestSwarm", transport.clone());
        (swarm, transport)
    }

    /// Every bucket entry has a matching entry in the agent's own sets and back.
    async fn assert_symmetric(swarm: &Swarm, agents: &[&Agent]) {
        for agent in agents {
            let groups = agent.groups().await;
            let capabilities = agent.capabilities().await;
            let attached = swarm.contains_agent(agent.name());
            for (group, members) in swarm.groups() {
                assert_eq!(members.contains(agent.name()), attached && groups.contains(&group));
            }
            for (capability, members) in swarm.capabilities() {
                assert_eq!(
                    members.contains(agent.name()),
                    attached && capabilities.contains(&capability)
                );
            }
            if attached {
                for group in &groups {
                    assert!(swarm.group_members(group).contains(agent.name()));
                }
                for capability in &capabilities {
                    assert!(swarm.capability_members(capability).contains(agent.name()));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_add_agent_enrolls_groups_and_capabilities() {
        let (swarm, _) = local_swarm();
        let agent = Agent::builder()
            .name("Agent1")
            .groups(["main", "analytics"])
            .capability("collect")
            .build();

        swarm.add_agent(&agent).await.unwrap();

        assert!(swarm.contains_agent("Agent1"));
        assert!(agent.is_attached().await);
        assert_eq!(swarm.groups().len(), 2);
        assert!(swarm.capability_members("collect").contains("Agent1"));
        assert_symmetric(&swarm, &[&agent]).await;
    }

    #[tokio::test]
    async fn test_add_agent_is_idempotent() {
        let (swarm, _) = local_swarm();
        let agent = Agent::builder().name("Agent1").group("main").build();

        swarm.add_agent(&agent).await.unwrap();
        swarm.add_agent(&agent).await.unwrap();

        assert_eq!(swarm.group_members("main").len(), 1);
        assert_eq!(swarm.agent_names(), vec!["Agent1".to_owned()]);
    }

    #[tokio::test]
    async fn test_duplicate_agent_name_is_rejected() {
        let (swarm, _) = local_swarm();
        let first = Agent::builder().name("Agent1").group("main").build();
        let second = Agent::builder().name("Agent1").group("other").build();

        swarm.add_agent(&first).await.unwrap();
        let err = swarm.add_agent(&second).await.unwrap_err();

        assert!(matches!(err, SwarmError::DuplicateAgent(ref name) if name == "Agent1"));
        assert!(swarm.group_members("other").is_empty());
        assert!(!second.is_attached().await);
    }

    #[tokio::test]
    async fn test_agent_cannot_join_two_swarms() {
        let (first, _) = local_swarm();
        let (second, _) = local_swarm();
        let agent = Agent::builder().name("Agent1").build();

        first.add_agent(&agent).await.unwrap();
        let err = second.add_agent(&agent).await.unwrap_err();
        assert!(matches!(err, SwarmError::AlreadyAttached { .. }));
    }

    #[tokio::test]
    async fn test_remove_agent_leaves_no_back_references() {
        let (swarm, _) = local_swarm();
        let agent = Agent::builder()
            .name("Agent1")
            .groups(["main", "analytics"])
            .capabilities(["collect", "scan"])
            .build();
        let other = Agent::builder().name("Agent2").group("main").build();
        swarm.add_agent(&agent).await.unwrap();
        swarm.add_agent(&other).await.unwrap();

        assert!(swarm.remove_agent(&agent).await.unwrap());

        assert!(!swarm.contains_agent("Agent1"));
        assert!(!agent.is_attached().await);
        assert_eq!(swarm.groups().keys().collect::<Vec<_>>(), vec!["main"]);
        assert!(swarm.capabilities().is_empty());
        assert_symmetric(&swarm, &[&agent, &other]).await;

        // Second removal is a no-op.
        assert!(!swarm.remove_agent(&agent).await.unwrap());
    }

    #[tokio::test]
    async fn test_membership_changes_require_attachment() {
        let (swarm, _) = local_swarm();
        let agent = Agent::builder().name("Loner").build();

        let err = swarm.add_agent_to_group(&agent, "main").await.unwrap_err();
        assert!(matches!(err, SwarmError::AgentNotAttached(_)));
        assert!(swarm.groups().is_empty());
        assert!(agent.groups().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_from_group_cleans_up_empty_bucket() {
        let (swarm, _) = local_swarm();
        let agent = Agent::builder()
            .name("Agent1")
            .groups(["main", "analytics"])
            .build();
        swarm.add_agent(&agent).await.unwrap();

        swarm.remove_agent_from_group(&agent, "analytics").await.unwrap();

        assert_eq!(agent.groups().await, BTreeSet::from(["main".to_owned()]));
        assert!(!swarm.groups().contains_key("analytics"));
        assert!(swarm.group_members("main").contains("Agent1"));

        // Leaving again is a no-op.
        swarm.remove_agent_from_group(&agent, "analytics").await.unwrap();
        assert_symmetric(&swarm, &[&agent]).await;
    }

    #[tokio::test]
    async fn test_capability_registration_round_trip() {
        let (swarm, _) = local_swarm();
        let agent = Agent::builder().name("Agent1").build();
        swarm.add_agent(&agent).await.unwrap();

        swarm.register_agent_capability(&agent, "miner").await.unwrap();
        assert!(swarm.capability_members("miner").contains("Agent1"));
        assert!(agent.capabilities().await.contains("miner"));

        swarm.unregister_agent_capability(&agent, "miner").await.unwrap();
        assert!(!swarm.capabilities().contains_key("miner"));
        assert!(agent.capabilities().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_group_reaches_each_member_mailbox() {
        let (swarm, transport) = local_swarm();
        let a = Agent::builder().name("a").group("main").build();
        let b = Agent::builder().name("b").group("main").build();
        let c = Agent::builder().name("c").group("other").build();
        for agent in [&a, &b, &c] {
            swarm.add_agent(agent).await.unwrap();
        }

        let sent = swarm.send_to_group("main", "hello").await.unwrap();

        assert_eq!(sent, 2);
        assert_eq!(transport.pending("agent.a"), 1);
        assert_eq!(transport.pending("agent.b"), 1);
        assert_eq!(transport.pending("agent.c"), 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_does_not_stop_group_fan_out() {
        let transport = Arc::new(LocalTransport::with_capacity(1));
        let swarm = Swarm::new("TestSwarm", transport.clone());
        for name in ["a", "b", "c"] {
            let agent = Agent::builder().name(name).group("g").build();
            swarm.add_agent(&agent).await.unwrap();
        }
        swarm.send_to_agent("a", "backlog").await.unwrap();

        let err = swarm.send_to_group("g", "status").await.unwrap_err();

        assert!(matches!(
            err,
            SwarmError::PartialDelivery {
                delivered: 2,
                recipients: 3,
                source: TransportError::QueueFull { .. },
            }
        ));
        assert_eq!(transport.pending("agent.b"), 1);
        assert_eq!(transport.pending("agent.c"), 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_agents_never_fills_up() {
        let transport = Arc::new(LocalTransport::with_capacity(2));
        let swarm = Swarm::new("TestSwarm", transport.clone());
        for _ in 0..5 {
            swarm.broadcast("anyone?").await.unwrap();
        }

        let agent = Agent::builder().name("late").build();
        swarm.add_agent(&agent).await.unwrap();
        swarm.broadcast("welcome").await.unwrap();
        assert_eq!(transport.pending("agent.late"), 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_group_or_capability_is_a_no_op() {
        let (swarm, transport) = local_swarm();
        assert_eq!(swarm.send_to_group("ghosts", "boo").await.unwrap(), 0);
        assert_eq!(swarm.send_to_capability("flying", "boo").await.unwrap(), 0);
        assert!(!transport.has_queue("ghosts"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_does_not_fail() {
        let (swarm, transport) = local_swarm();
        swarm.send_to_agent("nobody", "hi").await.unwrap();
        assert_eq!(transport.pending("agent.nobody"), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_attached_agent() {
        let (swarm, transport) = local_swarm();
        let a = Agent::builder().name("a").build();
        let b = Agent::builder().name("b").build();
        swarm.add_agent(&a).await.unwrap();
        swarm.add_agent(&b).await.unwrap();

        swarm.broadcast("all hands").await.unwrap();
        assert_eq!(transport.pending("agent.a"), 1);
        assert_eq!(transport.pending("agent.b"), 1);

        swarm.remove_agent(&b).await.unwrap();
        swarm.broadcast("again").await.unwrap();
        assert_eq!(transport.pending("agent.a"), 2);
        assert_eq!(transport.pending("agent.b"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_membership_changes_stay_symmetric() {
        let (swarm, _) = local_swarm();
        let agents = (0..8)
            .map(|i| Arc::new(Agent::builder().name(format!("agent-{i}")).build()))
            .collect::<Vec<_>>();
        for agent in &agents {
            swarm.add_agent(agent).await.unwrap();
        }

        let mut handles = Vec::new();
        for (i, agent) in agents.iter().enumerate() {
            let swarm = Arc::clone(&swarm);
            let agent = Arc::clone(agent);
            handles.push(tokio::spawn(async move {
                for round in 0..50 {
                    let group = format!("g{}", (i + round) % 3);
                    swarm.add_agent_to_group(&agent, &group).await.unwrap();
                    swarm.send_to_group(&group, "tick").await.ok();
                    if round % 2 == 0 {
                        swarm.remove_agent_from_group(&agent, &group).await.unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let refs = agents.iter().map(|agent| agent.as_ref()).collect::<Vec<_>>();
        assert_symmetric(&swarm, &refs).await;
        for members in swarm.groups().values() {
            assert!(!members.is_empty());
        }
    }

    #[tokio::test]
    async fn test_assign_task_requires_registered_type() {
        let (swarm, _) = local_swarm();
        let err = swarm.assign_task("collect", Value::Null).unwrap_err();
        assert!(matches!(err, SwarmError::TaskManagerError(TaskManagerError::UnknownTaskType(_))));
    }
}
