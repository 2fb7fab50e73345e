//! Container runtime driver interface.
//!
//! The engine only talks to the container daemon through [`RuntimeDriver`].
//! Every call may block; the caller bounds each one with an
//! operation-specific timeout.

pub mod mock;

use crate::model::{PortBinding, PortMapping};
use crate::status::HealthStatus;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use mock::{MockRuntime, NoopProvisioner, Operation};

/// Errors returned by a runtime driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The call did not finish within its timeout.
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The daemon could not be reached or is temporarily failing.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The daemon refused the request; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl RuntimeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Timeout { .. } | RuntimeError::Unavailable(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Timeout { .. })
    }
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub task_arn: String,
    pub container_name: String,
    pub image: String,
    pub image_digest: Option<String>,
    pub command: Vec<String>,
    pub cpu: u64,
    pub memory_mb: u64,
    pub port_mappings: Vec<PortMapping>,
    /// Runtime id of the container whose network namespace to join.
    pub network_container: Option<String>,
}

/// Coarse container state as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspect {
    pub state: RuntimeState,
    pub exit_code: Option<i32>,
    pub health: HealthStatus,
    pub port_bindings: Vec<PortBinding>,
}

/// Primitive container operations.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Resolve an image reference to its content digest.
    async fn pull_image_manifest(&self, image: &str) -> Result<String, RuntimeError>;

    async fn pull_image(&self, image: &str, digest: Option<&str>) -> Result<(), RuntimeError>;

    /// Create a container and return its runtime id.
    async fn create_container(&self, spec: &CreateSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop a container, killing it once `timeout` elapses.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = RuntimeError::Timeout {
            operation: "pull image",
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.is_timeout());
        assert!(RuntimeError::Unavailable("daemon restarting".into()).is_retryable());
        assert!(!RuntimeError::Rejected("bad spec".into()).is_retryable());
        assert!(!RuntimeError::NotFound("abc".into()).is_retryable());
    }
}
