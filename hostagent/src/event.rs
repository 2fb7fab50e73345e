//! State-change events reported to the control plane.
//!
//! The constructors decide whether an entity's current status is worth
//! reporting. A refusal is an [`EventError`]; callers log it at debug level
//! and move on.

use crate::model::{Attachment, Container, ManagedAgent, PortBinding, Task};
use crate::status::{AttachmentStatus, ContainerStatus, ManagedAgentStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Reasons a state change is not emitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("should not send events for internal tasks or containers: {0}")]
    Internal(String),

    #[error("status not recognized by the backend: {0}")]
    NotRecognized(String),

    #[error("status {status} already sent for {entity}")]
    AlreadySent { entity: String, status: String },

    #[error("no resolved digest to report for {0}")]
    NoDigest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStateChange {
    pub task_arn: String,
    pub container_name: String,
    pub runtime_id: Option<String>,
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub port_bindings: Vec<PortBinding>,
    pub image_digest: Option<String>,
    pub reason: Option<String>,
}

impl ContainerStateChange {
    /// Build the event for `container`'s current known status.
    pub fn new(task: &Task, container: &Container, reason: Option<&str>) -> Result<Self, EventError> {
        if task.internal || container.is_internal() {
            return Err(EventError::Internal(container.name.clone()));
        }
        let known = container.known_status();
        let steady = container.steady_state();
        if known != ContainerStatus::ManifestPulled && !known.should_report_to_backend(steady) {
            return Err(EventError::NotRecognized(format!(
                "container {} in {}",
                container.name, known
            )));
        }
        if known == ContainerStatus::ManifestPulled && !container.digest_resolved() {
            return Err(EventError::NoDigest(container.name.clone()));
        }
        if container.sent_status() >= known {
            return Err(EventError::AlreadySent {
                entity: format!("container {} of {}", container.name, task.arn),
                status: known.to_string(),
            });
        }

        let reason = reason
            .filter(|r| !r.is_empty())
            .or_else(|| container.reason())
            .map(str::to_string);

        Ok(Self {
            task_arn: task.arn.clone(),
            container_name: container.name.clone(),
            runtime_id: container.runtime_id().map(str::to_string),
            status: known.reported(steady),
            exit_code: container.exit_code(),
            port_bindings: container.port_bindings().to_vec(),
            image_digest: container.image_digest().map(str::to_string),
            reason,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStateChange {
    pub task_arn: String,
    pub status: TaskStatus,
    pub reason: Option<String>,
    pub pull_started_at: Option<DateTime<Utc>>,
    pub pull_stopped_at: Option<DateTime<Utc>>,
    pub execution_stopped_at: Option<DateTime<Utc>>,
}

impl TaskStateChange {
    pub fn new(task: &Task) -> Result<Self, EventError> {
        if task.internal {
            return Err(EventError::Internal(task.arn.clone()));
        }
        let known = task.known_status();
        if known != TaskStatus::ManifestPulled && !known.backend_recognized() {
            return Err(EventError::NotRecognized(format!("task {} in {}", task.arn, known)));
        }
        if task.sent_status() >= known {
            return Err(EventError::AlreadySent {
                entity: format!("task {}", task.arn),
                status: known.to_string(),
            });
        }
        if known == TaskStatus::ManifestPulled && !task.has_resolved_digest() {
            return Err(EventError::NoDigest(task.arn.clone()));
        }

        Ok(Self {
            task_arn: task.arn.clone(),
            status: known,
            reason: task.reason().map(str::to_string),
            pull_started_at: task.pull_started_at(),
            pull_stopped_at: task.pull_stopped_at(),
            execution_stopped_at: task.execution_stopped_at(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedAgentStateChange {
    pub task_arn: String,
    pub container_name: String,
    pub agent_name: String,
    pub status: ManagedAgentStatus,
    pub reason: Option<String>,
}

impl ManagedAgentStateChange {
    pub fn new(task: &Task, container: &Container, agent: &ManagedAgent) -> Result<Self, EventError> {
        if task.internal || container.is_internal() {
            return Err(EventError::Internal(container.name.clone()));
        }
        if !agent.status.should_report_to_backend() {
            return Err(EventError::NotRecognized(format!(
                "managed agent {} in {}",
                agent.name, agent.status
            )));
        }
        if agent.sent_status >= agent.status {
            return Err(EventError::AlreadySent {
                entity: format!("managed agent {} of {}", agent.name, container.name),
                status: agent.status.to_string(),
            });
        }
        Ok(Self {
            task_arn: task.arn.clone(),
            container_name: container.name.clone(),
            agent_name: agent.name.clone(),
            status: agent.status,
            reason: agent.reason.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentStateChange {
    pub task_arn: String,
    pub attachment_arn: String,
    pub status: AttachmentStatus,
}

impl AttachmentStateChange {
    pub fn new(task: &Task, attachment: &Attachment) -> Result<Self, EventError> {
        if attachment.status != AttachmentStatus::Attached {
            return Err(EventError::NotRecognized(format!(
                "attachment {} in {}",
                attachment.arn, attachment.status
            )));
        }
        if attachment.sent {
            return Err(EventError::AlreadySent {
                entity: format!("attachment {}", attachment.arn),
                status: attachment.status.to_string(),
            });
        }
        Ok(Self {
            task_arn: task.arn.clone(),
            attachment_arn: attachment.arn.clone(),
            status: attachment.status,
        })
    }
}

/// Any event handed to the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateChange {
    Container(ContainerStateChange),
    Task(TaskStateChange),
    ManagedAgent(ManagedAgentStateChange),
    Attachment(AttachmentStateChange),
}

impl StateChange {
    pub fn resource_type(&self) -> &'static str {
        match self {
            StateChange::Container(_) => "container",
            StateChange::Task(_) => "task",
            StateChange::ManagedAgent(_) => "managed_agent",
            StateChange::Attachment(_) => "attachment",
        }
    }

    /// The task the event belongs to.
    pub fn task_arn(&self) -> &str {
        match self {
            StateChange::Container(c) => &c.task_arn,
            StateChange::Task(t) => &t.task_arn,
            StateChange::ManagedAgent(m) => &m.task_arn,
            StateChange::Attachment(a) => &a.task_arn,
        }
    }

    /// Identifier of the entity within its task.
    pub fn resource_id(&self) -> &str {
        match self {
            StateChange::Container(c) => &c.container_name,
            StateChange::Task(t) => &t.task_arn,
            StateChange::ManagedAgent(m) => &m.agent_name,
            StateChange::Attachment(a) => &a.attachment_arn,
        }
    }

    /// Reported status rendered as a string.
    pub fn status(&self) -> String {
        match self {
            StateChange::Container(c) => c.status.to_string(),
            StateChange::Task(t) => t.status.to_string(),
            StateChange::ManagedAgent(m) => m.status.to_string(),
            StateChange::Attachment(a) => a.status.to_string(),
        }
    }
}
