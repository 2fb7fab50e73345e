//! Status enumerations for containers, tasks and their satellites.
//!
//! Every enumeration here is totally ordered by declaration order. Statuses
//! of different enumerations are distinct types and can never be compared
//! with each other.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a single container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    #[default]
    None,
    /// Image reference resolved to a content digest.
    ManifestPulled,
    Pulled,
    Created,
    Running,
    /// Task-level resources (network) attached through this container.
    ResourcesProvisioned,
    Stopped,
}

impl ContainerStatus {
    /// Statuses the control plane understands.
    pub fn backend_recognized(self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Stopped)
    }

    /// Whether a container in this status should produce an event, given the
    /// container's steady state.
    pub fn should_report_to_backend(self, steady_state: ContainerStatus) -> bool {
        self == steady_state || self == ContainerStatus::Stopped
    }

    /// Status carried by a container state change for this known status.
    pub fn reported(self, steady_state: ContainerStatus) -> ContainerStatus {
        if self == steady_state {
            return ContainerStatus::Running;
        }
        match self {
            ContainerStatus::ManifestPulled => ContainerStatus::ManifestPulled,
            ContainerStatus::Stopped => ContainerStatus::Stopped,
            _ => ContainerStatus::None,
        }
    }

    /// The step after this one on the way to `steady_state`, if any.
    pub fn next(self, steady_state: ContainerStatus) -> Option<ContainerStatus> {
        let next = match self {
            ContainerStatus::None => ContainerStatus::ManifestPulled,
            ContainerStatus::ManifestPulled => ContainerStatus::Pulled,
            ContainerStatus::Pulled => ContainerStatus::Created,
            ContainerStatus::Created => ContainerStatus::Running,
            ContainerStatus::Running => ContainerStatus::ResourcesProvisioned,
            ContainerStatus::ResourcesProvisioned | ContainerStatus::Stopped => return None,
        };
        (next <= steady_state).then_some(next)
    }

    pub fn is_terminal(self) -> bool {
        self == ContainerStatus::Stopped
    }

    /// Task status implied by a single container sitting in this status.
    pub fn task_status(self, steady_state: ContainerStatus) -> TaskStatus {
        match self {
            ContainerStatus::None => TaskStatus::None,
            ContainerStatus::ManifestPulled | ContainerStatus::Pulled => TaskStatus::ManifestPulled,
            ContainerStatus::Stopped => TaskStatus::Stopped,
            s if s >= steady_state => TaskStatus::Running,
            _ => TaskStatus::Created,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::None => "NONE",
            ContainerStatus::ManifestPulled => "MANIFEST_PULLED",
            ContainerStatus::Pulled => "PULLED",
            ContainerStatus::Created => "CREATED",
            ContainerStatus::Running => "RUNNING",
            ContainerStatus::ResourcesProvisioned => "RESOURCES_PROVISIONED",
            ContainerStatus::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Aggregate status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    None,
    ManifestPulled,
    /// Internal waypoint, never reported.
    Created,
    Running,
    Stopped,
}

impl TaskStatus {
    pub fn backend_recognized(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Stopped)
    }

    /// Desired container status that corresponds to this desired task status.
    pub fn container_target(self, steady_state: ContainerStatus) -> ContainerStatus {
        match self {
            TaskStatus::Stopped => ContainerStatus::Stopped,
            TaskStatus::None => ContainerStatus::None,
            _ => steady_state,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::None => "NONE",
            TaskStatus::ManifestPulled => "MANIFEST_PULLED",
            TaskStatus::Created => "CREATED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Container health as reported by the runtime's health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Status of an agent managed inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagedAgentStatus {
    #[default]
    Pending,
    Running,
    Stopped,
}

impl ManagedAgentStatus {
    pub fn should_report_to_backend(self) -> bool {
        matches!(self, ManagedAgentStatus::Running | ManagedAgentStatus::Stopped)
    }
}

impl fmt::Display for ManagedAgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManagedAgentStatus::Pending => "PENDING",
            ManagedAgentStatus::Running => "RUNNING",
            ManagedAgentStatus::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Status of a network attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentStatus {
    #[default]
    Attaching,
    Attached,
    Detached,
}

impl fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttachmentStatus::Attaching => "ATTACHING",
            AttachmentStatus::Attached => "ATTACHED",
            AttachmentStatus::Detached => "DETACHED",
        };
        f.write_str(s)
    }
}

/// Status of a task-level resource such as a volume or a secret bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    #[default]
    None,
    Created,
    Removed,
}
