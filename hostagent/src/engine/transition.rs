//! Per-container state progression.
//!
//! A step is split in two halves so the task loop can run several at once:
//! [`execute`] performs the runtime calls on a detached [`StepRequest`], and
//! [`apply`] folds the outcome back into the container. Only the task loop
//! calls [`apply`].

use crate::config::Config;
use crate::model::{Attachment, Container, PortBinding, Task, TaskResource};
use crate::provisioner::{ProvisionError, TaskProvisioner};
use crate::runtime::{ContainerInspect, CreateSpec, RuntimeDriver, RuntimeError, RuntimeState};
use crate::status::{ContainerStatus, HealthStatus};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Collaborators a step needs.
#[derive(Clone)]
pub struct StepContext {
    pub runtime: Arc<dyn RuntimeDriver>,
    pub provisioner: Arc<dyn TaskProvisioner>,
    pub config: Arc<Config>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Runtime(e) => e.is_retryable(),
            StepError::Provision(e) => e.is_retryable(),
        }
    }
}

/// A failed step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Could not transition to {target}; {source}")]
pub struct TransitionError {
    pub target: ContainerStatus,
    #[source]
    pub source: StepError,
}

impl TransitionError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Everything needed to run one step without borrowing the task.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub task_arn: String,
    pub container_name: String,
    pub target: ContainerStatus,
    pub image: String,
    pub image_digest: Option<String>,
    pub runtime_id: Option<String>,
    pub stop_timeout: Duration,
    pub create: Option<CreateSpec>,
    pub attachments: Vec<Attachment>,
}

impl StepRequest {
    pub fn new(task: &Task, container: &Container, target: ContainerStatus, config: &Config) -> Self {
        let create = (target == ContainerStatus::Created).then(|| CreateSpec {
            task_arn: task.arn.clone(),
            container_name: container.name.clone(),
            image: container.image.clone(),
            image_digest: container.image_digest().map(str::to_string),
            command: container.command.clone(),
            cpu: container.cpu,
            memory_mb: container.memory_mb,
            port_mappings: container.port_mappings.clone(),
            network_container: task
                .pause_container()
                .filter(|_| !container.is_internal())
                .and_then(|p| p.runtime_id().map(str::to_string)),
        });
        let attachments = if target == ContainerStatus::ResourcesProvisioned {
            task.attachments.clone()
        } else {
            Vec::new()
        };

        Self {
            task_arn: task.arn.clone(),
            container_name: container.name.clone(),
            target,
            image: container.image.clone(),
            image_digest: container.image_digest().map(str::to_string),
            runtime_id: container.runtime_id().map(str::to_string),
            stop_timeout: container.stop_timeout(config.default_stop_timeout),
            create,
            attachments,
        }
    }
}

/// What a successful step observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    ManifestPulled { digest: Option<String> },
    Pulled,
    Created {
        runtime_id: String,
        port_bindings: Vec<PortBinding>,
    },
    Running {
        health: HealthStatus,
        /// The container had already exited when inspected after start.
        exited: Option<i32>,
    },
    ResourcesProvisioned,
    Stopped { exit_code: Option<i32> },
}

/// Result of applying a step to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub status: ContainerStatus,
    pub error: Option<TransitionError>,
    pub exit_code: Option<i32>,
    pub retryable: bool,
}

/// The next status on the way from the container's known status to `target`.
///
/// Stopping is a single step from anywhere. Returns `None` when `target` is
/// at or below the known status.
pub fn next_step(container: &Container, target: ContainerStatus) -> Option<ContainerStatus> {
    let known = container.known_status();
    if target <= known {
        return None;
    }
    if target == ContainerStatus::Stopped {
        return Some(ContainerStatus::Stopped);
    }
    known
        .next(container.steady_state())
        .filter(|next| *next <= target)
}

async fn bounded<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .unwrap_or(Err(RuntimeError::Timeout { operation, after }))
}

async fn bounded_provision<F>(operation: &'static str, after: Duration, fut: F) -> Result<(), ProvisionError>
where
    F: Future<Output = Result<(), ProvisionError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .unwrap_or(Err(ProvisionError::Timeout { operation, after }))
}

/// Provision one task resource, bounded by the provision timeout.
pub async fn provision(
    ctx: &StepContext,
    task_arn: &str,
    resource: &TaskResource,
) -> Result<(), ProvisionError> {
    bounded_provision(
        "resource provisioning",
        ctx.config.provision_timeout,
        ctx.provisioner.provision_resource(task_arn, resource),
    )
    .await
}

pub async fn release(
    ctx: &StepContext,
    task_arn: &str,
    resource: &TaskResource,
) -> Result<(), ProvisionError> {
    bounded_provision(
        "resource release",
        ctx.config.provision_timeout,
        ctx.provisioner.release_resource(task_arn, resource),
    )
    .await
}

pub async fn teardown_network(ctx: &StepContext, task_arn: &str) -> Result<(), ProvisionError> {
    bounded_provision(
        "network teardown",
        ctx.config.provision_timeout,
        ctx.provisioner.teardown_network(task_arn),
    )
    .await
}

/// Inspect a container, bounded by the configured inspect timeout.
pub async fn inspect(ctx: &StepContext, id: &str) -> Result<ContainerInspect, RuntimeError> {
    bounded(
        "container inspect",
        ctx.config.inspect_timeout,
        ctx.runtime.inspect_container(id),
    )
    .await
}

/// Remove a container, bounded by the configured remove timeout.
pub async fn remove(ctx: &StepContext, id: &str) -> Result<(), RuntimeError> {
    bounded(
        "container remove",
        ctx.config.remove_timeout,
        ctx.runtime.remove_container(id),
    )
    .await
}

/// Digest pinned in an image reference like `repo@sha256:...`.
fn pinned_digest(image: &str) -> Option<&str> {
    image
        .split_once('@')
        .map(|(_, digest)| digest)
        .filter(|d| d.starts_with("sha256:"))
}

/// Run the runtime side of one step.
pub async fn execute(
    request: &StepRequest,
    ctx: &StepContext,
) -> Result<StepOutcome, TransitionError> {
    let target = request.target;
    run_step(request, ctx)
        .await
        .map_err(|source| TransitionError { target, source })
}

async fn run_step(request: &StepRequest, ctx: &StepContext) -> Result<StepOutcome, StepError> {
    let runtime = &ctx.runtime;
    let cfg = &ctx.config;
    let name = &request.container_name;

    match request.target {
        ContainerStatus::None => Err(StepError::Runtime(RuntimeError::Rejected(format!(
            "container {name} cannot transition to NONE"
        )))),
        ContainerStatus::ManifestPulled => {
            if let Some(digest) = pinned_digest(&request.image) {
                debug!("Container {}: image pinned to {}", name, digest);
                return Ok(StepOutcome::ManifestPulled {
                    digest: Some(digest.to_string()),
                });
            }
            let digest = bounded(
                "image manifest pull",
                cfg.manifest_pull_timeout,
                runtime.pull_image_manifest(&request.image),
            )
            .await?;
            Ok(StepOutcome::ManifestPulled {
                digest: Some(digest).filter(|d| !d.is_empty()),
            })
        }
        ContainerStatus::Pulled => {
            bounded(
                "image pull",
                cfg.image_pull_timeout,
                runtime.pull_image(&request.image, request.image_digest.as_deref()),
            )
            .await?;
            Ok(StepOutcome::Pulled)
        }
        ContainerStatus::Created => {
            let spec = request.create.clone().unwrap_or_else(|| CreateSpec {
                task_arn: request.task_arn.clone(),
                container_name: name.clone(),
                image: request.image.clone(),
                image_digest: request.image_digest.clone(),
                command: Vec::new(),
                cpu: 0,
                memory_mb: 0,
                port_mappings: Vec::new(),
                network_container: None,
            });
            let runtime_id = bounded(
                "container create",
                cfg.create_timeout,
                runtime.create_container(&spec),
            )
            .await?;
            let inspect = bounded(
                "container inspect",
                cfg.inspect_timeout,
                runtime.inspect_container(&runtime_id),
            )
            .await;
            let port_bindings = match inspect {
                Ok(inspect) => inspect.port_bindings,
                Err(e) => {
                    warn!("Container {}: could not read port bindings: {}", name, e);
                    Vec::new()
                }
            };
            Ok(StepOutcome::Created {
                runtime_id,
                port_bindings,
            })
        }
        ContainerStatus::Running => {
            let id = require_id(request)?;
            bounded("container start", cfg.start_timeout, runtime.start_container(id)).await?;
            let inspect = bounded(
                "container inspect",
                cfg.inspect_timeout,
                runtime.inspect_container(id),
            )
            .await?;
            let exited = (inspect.state == RuntimeState::Exited)
                .then(|| inspect.exit_code.unwrap_or(-1));
            Ok(StepOutcome::Running {
                health: inspect.health,
                exited,
            })
        }
        ContainerStatus::ResourcesProvisioned => {
            let id = require_id(request)?;
            bounded_provision(
                "network setup",
                cfg.provision_timeout,
                ctx.provisioner
                    .setup_network(&request.task_arn, id, &request.attachments),
            )
            .await?;
            Ok(StepOutcome::ResourcesProvisioned)
        }
        ContainerStatus::Stopped => {
            let Some(id) = request.runtime_id.as_deref() else {
                return Ok(StepOutcome::Stopped { exit_code: None });
            };
            let after = request.stop_timeout + cfg.stop_timeout_buffer;
            let stopped = bounded(
                "container stop",
                after,
                runtime.stop_container(id, request.stop_timeout),
            )
            .await;
            match stopped {
                Ok(()) => {}
                Err(RuntimeError::NotFound(_)) => {
                    debug!("Container {}: already gone from the runtime", name);
                    return Ok(StepOutcome::Stopped { exit_code: None });
                }
                Err(e) => return Err(e.into()),
            }
            let inspect = bounded(
                "container inspect",
                cfg.inspect_timeout,
                runtime.inspect_container(id),
            )
            .await;
            let exit_code = match inspect {
                Ok(inspect) => inspect.exit_code,
                Err(e) => {
                    warn!("Container {}: could not read exit code: {}", name, e);
                    None
                }
            };
            Ok(StepOutcome::Stopped { exit_code })
        }
    }
}

fn require_id(request: &StepRequest) -> Result<&str, StepError> {
    request.runtime_id.as_deref().ok_or_else(|| {
        StepError::Runtime(RuntimeError::NotFound(format!(
            "container {} was never created",
            request.container_name
        )))
    })
}

/// Fold a step's outcome into the container.
pub fn apply(
    container: &mut Container,
    outcome: Result<StepOutcome, TransitionError>,
) -> TransitionResult {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(error) => {
            container.set_reason(error.to_string());
            return TransitionResult {
                status: container.known_status(),
                retryable: error.is_retryable(),
                error: Some(error),
                exit_code: container.exit_code(),
            };
        }
    };

    let status = match outcome {
        StepOutcome::ManifestPulled { digest } => {
            if let Some(digest) = digest {
                container.set_image_digest(digest);
            }
            ContainerStatus::ManifestPulled
        }
        StepOutcome::Pulled => ContainerStatus::Pulled,
        StepOutcome::Created {
            runtime_id,
            port_bindings,
        } => {
            container.set_runtime_id(runtime_id);
            container.set_port_bindings(port_bindings);
            ContainerStatus::Created
        }
        StepOutcome::Running { health, .. } => {
            container.set_health(health);
            ContainerStatus::Running
        }
        StepOutcome::ResourcesProvisioned => ContainerStatus::ResourcesProvisioned,
        StepOutcome::Stopped { exit_code } => {
            if let Some(code) = exit_code {
                container.set_exit_code(code);
            }
            ContainerStatus::Stopped
        }
    };

    if !container.set_known_status(status) {
        debug!(
            "Container {}: ignoring stale transition to {} (known {})",
            container.name,
            status,
            container.known_status()
        );
    }
    TransitionResult {
        status: container.known_status(),
        error: None,
        exit_code: container.exit_code(),
        retryable: false,
    }
}

/// Take one step of `container` in `task` towards `target`.
///
/// A target at or below the known status returns the current state without
/// touching the runtime.
pub async fn progress(
    task: &mut Task,
    container_name: &str,
    target: ContainerStatus,
    ctx: &StepContext,
) -> Option<TransitionResult> {
    let container = task.container(container_name)?;
    let Some(step) = next_step(container, target) else {
        return Some(TransitionResult {
            status: container.known_status(),
            error: None,
            exit_code: container.exit_code(),
            retryable: false,
        });
    };
    let request = StepRequest::new(task, container, step, &ctx.config);
    let outcome = execute(&request, ctx).await;
    let container = task.container_mut(container_name)?;
    Some(apply(container, outcome))
}
