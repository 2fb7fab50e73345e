//! Task entity.

use super::container::{Container, Protocol};
use crate::status::{AttachmentStatus, ContainerStatus, ResourceStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the capacity behind a task is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LaunchType {
    #[default]
    Ec2,
    /// Capacity provisioned outside this host's accounting.
    Fargate,
    External,
    #[serde(other)]
    Unknown,
}

impl LaunchType {
    /// Whether tasks of this launch type are tracked by the resource ledger.
    pub fn is_accounted(self) -> bool {
        !matches!(self, LaunchType::Fargate)
    }
}

impl fmt::Display for LaunchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaunchType::Ec2 => "EC2",
            LaunchType::Fargate => "FARGATE",
            LaunchType::External => "EXTERNAL",
            LaunchType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Volume,
    Credentials,
    Secrets,
}

/// A task-scoped resource that must exist before containers are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResource {
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub known_status: ResourceStatus,
    #[serde(default = "default_resource_desired")]
    pub desired_status: ResourceStatus,
}

fn default_resource_desired() -> ResourceStatus {
    ResourceStatus::Created
}

impl TaskResource {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            known_status: ResourceStatus::None,
            desired_status: ResourceStatus::Created,
        }
    }
}

/// Network attachment (ENI) bound to the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub arn: String,
    #[serde(default)]
    pub status: AttachmentStatus,
    #[serde(default)]
    pub sent: bool,
}

impl Attachment {
    pub fn new(arn: impl Into<String>) -> Self {
        Self {
            arn: arn.into(),
            status: AttachmentStatus::Attaching,
            sent: false,
        }
    }
}

/// A group of containers and resources scheduled as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub arn: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub launch_type: LaunchType,
    /// Task-level CPU reservation. Falls back to the sum over containers.
    #[serde(default)]
    pub cpu: Option<u64>,
    /// Task-level memory reservation. Falls back to the sum over containers.
    #[serde(default)]
    pub memory_mb: Option<u64>,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub resources: Vec<TaskResource>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Internal tasks are never reported.
    #[serde(default)]
    pub internal: bool,

    #[serde(default = "default_task_desired")]
    desired_status: TaskStatus,
    #[serde(default)]
    known_status: TaskStatus,
    #[serde(default)]
    sent_status: TaskStatus,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    pull_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pull_stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    execution_stopped_at: Option<DateTime<Utc>>,
}

fn default_task_desired() -> TaskStatus {
    TaskStatus::Running
}

impl Task {
    pub fn new(arn: impl Into<String>, containers: Vec<Container>) -> Self {
        Self {
            arn: arn.into(),
            family: String::new(),
            version: String::new(),
            launch_type: LaunchType::Ec2,
            cpu: None,
            memory_mb: None,
            containers,
            resources: Vec::new(),
            attachments: Vec::new(),
            internal: false,
            desired_status: TaskStatus::Running,
            known_status: TaskStatus::None,
            sent_status: TaskStatus::None,
            reason: None,
            pull_started_at: None,
            pull_stopped_at: None,
            execution_stopped_at: None,
        }
    }

    pub fn with_launch_type(mut self, launch_type: LaunchType) -> Self {
        self.launch_type = launch_type;
        self
    }

    pub fn with_resources(mut self, cpu: u64, memory_mb: u64) -> Self {
        self.cpu = Some(cpu);
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn with_desired_status(mut self, status: TaskStatus) -> Self {
        self.desired_status = status;
        self
    }

    pub fn desired_status(&self) -> TaskStatus {
        self.desired_status
    }

    pub fn known_status(&self) -> TaskStatus {
        self.known_status
    }

    pub fn sent_status(&self) -> TaskStatus {
        self.sent_status
    }

    pub fn set_desired_status(&mut self, status: TaskStatus) -> bool {
        if status < self.desired_status {
            return false;
        }
        self.desired_status = status;
        true
    }

    pub fn set_known_status(&mut self, status: TaskStatus) -> bool {
        if status < self.known_status {
            return false;
        }
        self.known_status = status;
        true
    }

    pub fn set_sent_status(&mut self, status: TaskStatus) -> bool {
        if status < self.sent_status || status > self.known_status {
            return false;
        }
        self.sent_status = status;
        true
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Set the stop reason. The first reason wins.
    pub fn set_reason(&mut self, reason: impl Into<String>) {
        if self.reason.is_none() {
            self.reason = Some(reason.into());
        }
    }

    pub fn pull_started_at(&self) -> Option<DateTime<Utc>> {
        self.pull_started_at
    }

    pub fn pull_stopped_at(&self) -> Option<DateTime<Utc>> {
        self.pull_stopped_at
    }

    pub fn execution_stopped_at(&self) -> Option<DateTime<Utc>> {
        self.execution_stopped_at
    }

    pub fn mark_pull_started(&mut self) {
        self.pull_started_at.get_or_insert_with(Utc::now);
    }

    pub fn mark_pull_stopped(&mut self) {
        self.pull_stopped_at.get_or_insert_with(Utc::now);
    }

    pub fn mark_execution_stopped(&mut self) {
        self.execution_stopped_at.get_or_insert_with(Utc::now);
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn container_mut(&mut self, name: &str) -> Option<&mut Container> {
        self.containers.iter_mut().find(|c| c.name == name)
    }

    pub fn pause_container(&self) -> Option<&Container> {
        self.containers.iter().find(|c| c.is_internal())
    }

    pub fn has_resolved_digest(&self) -> bool {
        self.containers
            .iter()
            .any(|c| !c.is_internal() && c.digest_resolved())
    }

    pub fn resources_created(&self) -> bool {
        self.resources
            .iter()
            .all(|r| r.known_status >= ResourceStatus::Created)
    }

    pub fn all_containers_stopped(&self) -> bool {
        self.containers
            .iter()
            .all(|c| c.known_status() == ContainerStatus::Stopped)
    }

    /// Total CPU units this task reserves, `None` if the container sum
    /// overflows.
    pub fn cpu_units(&self) -> Option<u64> {
        match self.cpu {
            Some(cpu) => Some(cpu),
            None => checked_sum(self.containers.iter().map(|c| c.cpu)),
        }
    }

    /// Total memory in MB this task reserves, `None` on overflow.
    pub fn memory(&self) -> Option<u64> {
        match self.memory_mb {
            Some(memory) => Some(memory),
            None => checked_sum(self.containers.iter().map(|c| c.memory_mb)),
        }
    }

    /// Static host ports requested by any container, grouped by protocol.
    pub fn host_ports(&self) -> (Vec<u16>, Vec<u16>) {
        let mut tcp = Vec::new();
        let mut udp = Vec::new();
        for (port, protocol) in self.containers.iter().flat_map(|c| c.host_ports()) {
            match protocol {
                Protocol::Tcp => tcp.push(port),
                Protocol::Udp => udp.push(port),
            }
        }
        (tcp, udp)
    }
}

fn checked_sum(mut values: impl Iterator<Item = u64>) -> Option<u64> {
    values.try_fold(0u64, |acc, v| acc.checked_add(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_monotonic() {
        let mut task = Task::new("arn:task/1", vec![Container::new("app", "busybox")]);
        assert!(task.set_known_status(TaskStatus::Running));
        assert!(!task.set_known_status(TaskStatus::ManifestPulled));
        assert!(!task.set_sent_status(TaskStatus::Stopped));
        assert!(task.set_sent_status(TaskStatus::Running));
    }

    #[test]
    fn test_requirements_fall_back_to_containers() {
        let task = Task::new(
            "arn:task/1",
            vec![
                Container::new("a", "busybox").with_resources(256, 512),
                Container::new("b", "busybox").with_resources(128, 256),
            ],
        );
        assert_eq!(task.cpu_units(), Some(384));
        assert_eq!(task.memory(), Some(768));

        let task = task.with_resources(1024, 2048);
        assert_eq!(task.cpu_units(), Some(1024));
        assert_eq!(task.memory(), Some(2048));
    }

    #[test]
    fn test_requirements_overflow() {
        let task = Task::new(
            "arn:task/1",
            vec![
                Container::new("a", "busybox").with_resources(u64::MAX, 1),
                Container::new("b", "busybox").with_resources(2, 1),
            ],
        );
        assert_eq!(task.cpu_units(), None);
        assert_eq!(task.memory(), Some(2));
    }

    #[test]
    fn test_first_reason_wins() {
        let mut task = Task::new("arn:task/1", vec![]);
        task.set_reason("essential container exited");
        task.set_reason("later");
        assert_eq!(task.reason(), Some("essential container exited"));
    }

    #[test]
    fn test_launch_type_accounting() {
        assert!(LaunchType::Ec2.is_accounted());
        assert!(LaunchType::External.is_accounted());
        assert!(!LaunchType::Fargate.is_accounted());
        let lt: LaunchType = serde_json::from_str("\"FARGATE\"").unwrap();
        assert_eq!(lt, LaunchType::Fargate);
    }

    #[test]
    fn test_deserialize_task_defaults() {
        let json = r#"{"arn":"arn:task/9","containers":[{"name":"app","image":"nginx"}]}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.desired_status(), TaskStatus::Running);
        assert_eq!(task.known_status(), TaskStatus::None);
        assert_eq!(task.launch_type, LaunchType::Ec2);
        assert!(task.resources_created());
    }
}
