//! Container entity.

use crate::status::{ContainerStatus, HealthStatus, ManagedAgentStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of container within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// Regular workload container.
    #[default]
    Normal,
    /// Internal container holding the task's network namespace.
    Pause,
}

impl ContainerKind {
    pub fn steady_state(self) -> ContainerStatus {
        match self {
            ContainerKind::Normal => ContainerStatus::Running,
            ContainerKind::Pause => ContainerStatus::ResourcesProvisioned,
        }
    }

    pub fn is_internal(self) -> bool {
        matches!(self, ContainerKind::Pause)
    }
}

/// Condition a dependency must meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyCondition {
    Start,
    Complete,
    Success,
    Healthy,
}

/// Ordering dependency on another container of the same task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOn {
    pub container_name: String,
    pub condition: DependencyCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Requested port mapping. A missing host port asks the runtime to pick one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Port binding observed on a created container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
    pub bind_ip: String,
}

/// Agent running inside a container (for example an exec agent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedAgent {
    pub name: String,
    #[serde(default)]
    pub status: ManagedAgentStatus,
    #[serde(default)]
    pub sent_status: ManagedAgentStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ManagedAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ManagedAgentStatus::Pending,
            sent_status: ManagedAgentStatus::Pending,
            reason: None,
        }
    }
}

/// A container owned by a task.
///
/// Status fields only move forward; use the setters, which refuse
/// regressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub kind: ContainerKind,
    #[serde(default = "default_essential")]
    pub essential: bool,
    #[serde(default)]
    pub cpu: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub depends_on: Vec<DependsOn>,
    /// Per-container stop grace period, overriding the configured default.
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,
    #[serde(default)]
    pub managed_agents: Vec<ManagedAgent>,

    #[serde(default)]
    desired_status: ContainerStatus,
    #[serde(default)]
    known_status: ContainerStatus,
    #[serde(default)]
    sent_status: ContainerStatus,
    #[serde(default)]
    runtime_id: Option<String>,
    #[serde(default)]
    image_digest: Option<String>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    health: HealthStatus,
    #[serde(default)]
    port_bindings: Vec<PortBinding>,
    #[serde(default)]
    reason: Option<String>,
}

fn default_essential() -> bool {
    true
}

impl Container {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            kind: ContainerKind::Normal,
            essential: true,
            cpu: 0,
            memory_mb: 0,
            command: Vec::new(),
            port_mappings: Vec::new(),
            depends_on: Vec::new(),
            stop_timeout_secs: None,
            managed_agents: Vec::new(),
            desired_status: ContainerStatus::None,
            known_status: ContainerStatus::None,
            sent_status: ContainerStatus::None,
            runtime_id: None,
            image_digest: None,
            exit_code: None,
            health: HealthStatus::Unknown,
            port_bindings: Vec::new(),
            reason: None,
        }
    }

    pub fn with_essential(mut self, essential: bool) -> Self {
        self.essential = essential;
        self
    }

    pub fn with_kind(mut self, kind: ContainerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, condition: DependencyCondition) -> Self {
        self.depends_on.push(DependsOn {
            container_name: name.into(),
            condition,
        });
        self
    }

    pub fn with_resources(mut self, cpu: u64, memory_mb: u64) -> Self {
        self.cpu = cpu;
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_port(mut self, container_port: u16, host_port: Option<u16>) -> Self {
        self.port_mappings.push(PortMapping {
            container_port,
            host_port,
            protocol: Protocol::Tcp,
        });
        self
    }

    pub fn with_stop_timeout(mut self, secs: u64) -> Self {
        self.stop_timeout_secs = Some(secs);
        self
    }

    pub fn with_managed_agent(mut self, name: impl Into<String>) -> Self {
        self.managed_agents.push(ManagedAgent::new(name));
        self
    }

    pub fn steady_state(&self) -> ContainerStatus {
        self.kind.steady_state()
    }

    pub fn is_internal(&self) -> bool {
        self.kind.is_internal()
    }

    pub fn desired_status(&self) -> ContainerStatus {
        self.desired_status
    }

    pub fn known_status(&self) -> ContainerStatus {
        self.known_status
    }

    pub fn sent_status(&self) -> ContainerStatus {
        self.sent_status
    }

    /// Advance the desired status. Returns false if `status` would regress it.
    pub fn set_desired_status(&mut self, status: ContainerStatus) -> bool {
        if status < self.desired_status {
            return false;
        }
        self.desired_status = status;
        true
    }

    /// Advance the known status. Returns false if `status` would regress it.
    pub fn set_known_status(&mut self, status: ContainerStatus) -> bool {
        if status < self.known_status {
            return false;
        }
        self.known_status = status;
        true
    }

    /// Record that `status` was reported. Never exceeds the known status.
    pub fn set_sent_status(&mut self, status: ContainerStatus) -> bool {
        if status < self.sent_status || status > self.known_status {
            return false;
        }
        self.sent_status = status;
        true
    }

    pub fn runtime_id(&self) -> Option<&str> {
        self.runtime_id.as_deref()
    }

    pub fn set_runtime_id(&mut self, id: String) {
        self.runtime_id = Some(id);
    }

    pub fn image_digest(&self) -> Option<&str> {
        self.image_digest.as_deref()
    }

    pub fn set_image_digest(&mut self, digest: String) {
        self.image_digest = Some(digest);
    }

    pub fn digest_resolved(&self) -> bool {
        self.image_digest.as_deref().is_some_and(|d| !d.is_empty())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    pub fn health(&self) -> HealthStatus {
        self.health
    }

    pub fn set_health(&mut self, health: HealthStatus) {
        self.health = health;
    }

    pub fn port_bindings(&self) -> &[PortBinding] {
        &self.port_bindings
    }

    pub fn set_port_bindings(&mut self, bindings: Vec<PortBinding>) {
        self.port_bindings = bindings;
    }

    /// Human-readable reason for the last failure, if any.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    /// Grace period given to the container between stop and kill.
    pub fn stop_timeout(&self, default: Duration) -> Duration {
        self.stop_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Static host ports requested by this container.
    pub fn host_ports(&self) -> impl Iterator<Item = (u16, Protocol)> + '_ {
        self.port_mappings
            .iter()
            .filter_map(|m| m.host_port.filter(|p| *p != 0).map(|p| (p, m.protocol)))
    }

    pub fn depends_on_container(&self, name: &str) -> bool {
        self.depends_on.iter().any(|d| d.container_name == name)
    }
}
