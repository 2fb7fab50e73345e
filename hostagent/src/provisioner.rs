//! Task-level resource and network provisioning interface.

use crate::model::{Attachment, TaskResource};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("failed to provision resource {name}: {message}")]
    Resource { name: String, message: String },

    #[error("network setup failed: {0}")]
    Network(String),

    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl ProvisionError {
    /// Only timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Timeout { .. })
    }
}

/// Volumes, credentials, secrets and networking for a task.
///
/// Called by the task loop before any container may be created, and again
/// at cleanup.
#[async_trait]
pub trait TaskProvisioner: Send + Sync {
    async fn provision_resource(
        &self,
        task_arn: &str,
        resource: &TaskResource,
    ) -> Result<(), ProvisionError>;

    async fn release_resource(
        &self,
        task_arn: &str,
        resource: &TaskResource,
    ) -> Result<(), ProvisionError>;

    /// Wire the task's attachments into the network container's namespace.
    async fn setup_network(
        &self,
        task_arn: &str,
        network_container: &str,
        attachments: &[Attachment],
    ) -> Result<(), ProvisionError>;

    async fn teardown_network(&self, task_arn: &str) -> Result<(), ProvisionError>;
}
