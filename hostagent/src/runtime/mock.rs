//! In-memory runtime and provisioner.
//!
//! Used by the daemon's local mode and by tests. Failures, delays, exits and
//! health can be scripted per container name (or per image for pulls).

use super::{ContainerInspect, CreateSpec, RuntimeDriver, RuntimeError, RuntimeState};
use crate::model::{Attachment, PortBinding, TaskResource};
use crate::provisioner::{ProvisionError, TaskProvisioner};
use crate::status::HealthStatus;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Exit code reported for a container stopped through the runtime.
pub const STOPPED_EXIT_CODE: i32 = 143;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PullManifest,
    PullImage,
    Create,
    Start,
    Stop,
    Inspect,
    Remove,
}

/// One recorded runtime call. `target` is the image for pulls and the
/// container name otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub target: String,
}

#[derive(Debug)]
struct MockContainer {
    name: String,
    state: RuntimeState,
    exit_code: Option<i32>,
    port_bindings: Vec<PortBinding>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    next_failures: HashMap<(Operation, String), VecDeque<RuntimeError>>,
    sticky_failures: HashMap<(Operation, String), RuntimeError>,
    delays: HashMap<Operation, Duration>,
    digests: HashMap<String, Option<String>>,
    exit_on_start: HashMap<String, i32>,
    health: HashMap<String, HealthStatus>,
    calls: Vec<Call>,
    next_host_port: u16,
}

#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `operation` on `target` once with `error`.
    pub fn fail_next(&self, operation: Operation, target: &str, error: RuntimeError) {
        self.lock()
            .next_failures
            .entry((operation, target.to_string()))
            .or_default()
            .push_back(error);
    }

    /// Fail every `operation` on `target` with `error`.
    pub fn fail_always(&self, operation: Operation, target: &str, error: RuntimeError) {
        self.lock()
            .sticky_failures
            .insert((operation, target.to_string()), error);
    }

    pub fn set_delay(&self, operation: Operation, delay: Duration) {
        self.lock().delays.insert(operation, delay);
    }

    /// Override the digest returned for `image`. `None` resolves no digest.
    pub fn set_manifest_digest(&self, image: &str, digest: Option<&str>) {
        self.lock()
            .digests
            .insert(image.to_string(), digest.map(str::to_string));
    }

    /// Make the named container exit with `code` as soon as it starts.
    pub fn exit_on_start(&self, name: &str, code: i32) {
        self.lock().exit_on_start.insert(name.to_string(), code);
    }

    /// Make a running container exit with `code`.
    pub fn exit_container(&self, name: &str, code: i32) {
        let mut state = self.lock();
        for c in state.containers.values_mut().filter(|c| c.name == name) {
            if c.state == RuntimeState::Running {
                c.state = RuntimeState::Exited;
                c.exit_code = Some(code);
            }
        }
    }

    pub fn set_health(&self, name: &str, health: HealthStatus) {
        self.lock().health.insert(name.to_string(), health);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn calls_for(&self, operation: Operation, target: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation && c.target == target)
            .count()
    }

    /// Names of containers the runtime currently knows about.
    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.values().map(|c| c.name.clone()).collect()
    }

    pub fn running_containers(&self) -> Vec<String> {
        self.lock()
            .containers
            .values()
            .filter(|c| c.state == RuntimeState::Running)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Record the call, apply the scripted delay and return a scripted failure.
    async fn enter(&self, operation: Operation, target: &str) -> Result<(), RuntimeError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(Call {
                operation,
                target: target.to_string(),
            });
            state.delays.get(&operation).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let key = (operation, target.to_string());
        if let Some(err) = state.next_failures.get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if let Some(err) = state.sticky_failures.get(&key) {
            return Err(err.clone());
        }
        Ok(())
    }

    fn name_of(&self, id: &str) -> Result<String, RuntimeError> {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

fn default_digest(image: &str) -> String {
    let mut hasher = DefaultHasher::new();
    image.hash(&mut hasher);
    format!("sha256:{:064x}", hasher.finish())
}

#[async_trait]
impl RuntimeDriver for MockRuntime {
    async fn pull_image_manifest(&self, image: &str) -> Result<String, RuntimeError> {
        self.enter(Operation::PullManifest, image).await?;
        let digest = match self.lock().digests.get(image) {
            Some(Some(d)) => d.clone(),
            Some(None) => String::new(),
            None => default_digest(image),
        };
        debug!("MockRuntime: Resolved {} to {:?}", image, digest);
        Ok(digest)
    }

    async fn pull_image(&self, image: &str, digest: Option<&str>) -> Result<(), RuntimeError> {
        self.enter(Operation::PullImage, image).await?;
        debug!("MockRuntime: Pulled {} ({:?})", image, digest);
        Ok(())
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
        self.enter(Operation::Create, &spec.container_name).await?;
        let id = Uuid::new_v4().to_string();
        let mut state = self.lock();
        let mut port_bindings = Vec::new();
        for mapping in &spec.port_mappings {
            let host_port = match mapping.host_port {
                Some(p) if p != 0 => p,
                _ => {
                    state.next_host_port = state.next_host_port.max(32768).wrapping_add(1);
                    state.next_host_port
                }
            };
            port_bindings.push(PortBinding {
                container_port: mapping.container_port,
                host_port,
                protocol: mapping.protocol,
                bind_ip: "0.0.0.0".to_string(),
            });
        }
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: spec.container_name.clone(),
                state: RuntimeState::Created,
                exit_code: None,
                port_bindings,
            },
        );
        debug!("MockRuntime: Created {} as {}", spec.container_name, id);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let name = self.name_of(id)?;
        self.enter(Operation::Start, &name).await?;
        let mut state = self.lock();
        let exit = state.exit_on_start.get(&name).copied();
        if let Some(c) = state.containers.get_mut(id) {
            match exit {
                Some(code) => {
                    c.state = RuntimeState::Exited;
                    c.exit_code = Some(code);
                }
                None => c.state = RuntimeState::Running,
            }
        }
        debug!("MockRuntime: Started {}", name);
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let name = self.name_of(id)?;
        self.enter(Operation::Stop, &name).await?;
        let mut state = self.lock();
        if let Some(c) = state.containers.get_mut(id) {
            if c.state != RuntimeState::Exited {
                c.state = RuntimeState::Exited;
                c.exit_code = Some(STOPPED_EXIT_CODE);
            }
        }
        debug!("MockRuntime: Stopped {} (timeout {:?})", name, timeout);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, RuntimeError> {
        let name = self.name_of(id)?;
        self.enter(Operation::Inspect, &name).await?;
        let state = self.lock();
        let c = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerInspect {
            state: c.state,
            exit_code: c.exit_code,
            health: state.health.get(&name).copied().unwrap_or_default(),
            port_bindings: c.port_bindings.clone(),
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let name = self.name_of(id)?;
        self.enter(Operation::Remove, &name).await?;
        self.lock().containers.remove(id);
        debug!("MockRuntime: Removed {}", name);
        Ok(())
    }
}

/// Provisioner that succeeds without doing anything, except for resources
/// explicitly marked as failing or slowed down.
#[derive(Debug, Default)]
pub struct NoopProvisioner {
    failing: Mutex<HashSet<String>>,
    released: Mutex<Vec<String>>,
    attempts: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl NoopProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_resource(&self, name: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }

    /// Delay every resource provisioning and network setup call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Names of resources a provisioning call was made for, in call order.
    pub fn provision_attempts(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Names of resources released so far.
    pub fn released(&self) -> Vec<String> {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TaskProvisioner for NoopProvisioner {
    async fn provision_resource(
        &self,
        task_arn: &str,
        resource: &TaskResource,
    ) -> Result<(), ProvisionError> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resource.name.clone());
        self.pause().await;
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&resource.name);
        if failing {
            return Err(ProvisionError::Resource {
                name: resource.name.clone(),
                message: "scripted failure".to_string(),
            });
        }
        debug!("NoopProvisioner: Provisioned {} for {}", resource.name, task_arn);
        Ok(())
    }

    async fn release_resource(
        &self,
        task_arn: &str,
        resource: &TaskResource,
    ) -> Result<(), ProvisionError> {
        debug!("NoopProvisioner: Released {} for {}", resource.name, task_arn);
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resource.name.clone());
        Ok(())
    }

    async fn setup_network(
        &self,
        task_arn: &str,
        network_container: &str,
        attachments: &[Attachment],
    ) -> Result<(), ProvisionError> {
        self.pause().await;
        debug!(
            "NoopProvisioner: Network for {} via {} ({} attachments)",
            task_arn,
            network_container,
            attachments.len()
        );
        Ok(())
    }

    async fn teardown_network(&self, task_arn: &str) -> Result<(), ProvisionError> {
        debug!("NoopProvisioner: Tore down network for {}", task_arn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> CreateSpec {
        CreateSpec {
            task_arn: "arn:task/1".into(),
            container_name: name.into(),
            image: "busybox".into(),
            image_digest: None,
            command: vec![],
            cpu: 0,
            memory_mb: 0,
            port_mappings: vec![],
            network_container: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let rt = MockRuntime::new();
        let id = rt.create_container(&spec("app")).await.unwrap();
        rt.start_container(&id).await.unwrap();
        assert_eq!(rt.running_containers(), vec!["app".to_string()]);
        rt.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        let inspect = rt.inspect_container(&id).await.unwrap();
        assert_eq!(inspect.state, RuntimeState::Exited);
        assert_eq!(inspect.exit_code, Some(STOPPED_EXIT_CODE));
        rt.remove_container(&id).await.unwrap();
        assert!(rt.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failure_once() {
        let rt = MockRuntime::new();
        rt.fail_next(
            Operation::PullImage,
            "busybox",
            RuntimeError::Unavailable("daemon busy".into()),
        );
        assert!(rt.pull_image("busybox", None).await.is_err());
        assert!(rt.pull_image("busybox", None).await.is_ok());
        assert_eq!(rt.calls_for(Operation::PullImage, "busybox"), 2);
    }

    #[tokio::test]
    async fn test_manifest_digest_override() {
        let rt = MockRuntime::new();
        let d = rt.pull_image_manifest("nginx").await.unwrap();
        assert!(d.starts_with("sha256:"));
        rt.set_manifest_digest("nginx", None);
        assert_eq!(rt.pull_image_manifest("nginx").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_exit_on_start() {
        let rt = MockRuntime::new();
        rt.exit_on_start("job", 3);
        let id = rt.create_container(&spec("job")).await.unwrap();
        rt.start_container(&id).await.unwrap();
        let inspect = rt.inspect_container(&id).await.unwrap();
        assert_eq!(inspect.exit_code, Some(3));
    }
}
