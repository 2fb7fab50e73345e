//! Test helpers for hostagent engine tests.

#![allow(dead_code)]

use hostagent::{
    Config, Container, Engine, HostResources, MockRuntime, NoopProvisioner, StateChange,
    StateChangeEvents, Task, TaskStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// How long to wait for a single event before failing the test.
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with fast polling and retries and a cleanup wait long enough
/// that tests can look at stopped tasks.
pub fn test_config() -> Config {
    Config {
        host: HostResources {
            cpu_units: 1024,
            memory_mb: 2048,
            ..HostResources::default()
        },
        steady_state_poll_interval: Duration::from_millis(20),
        task_cleanup_wait: Duration::from_secs(3600),
        retry_backoff_base: Duration::from_millis(10),
        retry_backoff_max: Duration::from_millis(50),
        checkpoint_interval: Duration::from_secs(3600),
        ..Config::default()
    }
}

/// Single container task with the given task level cpu and memory.
pub fn simple_task(arn: &str, cpu: u64, memory_mb: u64) -> Task {
    Task::new(arn, vec![Container::new("web", "nginx:latest")]).with_resources(cpu, memory_mb)
}

/// Engine wired to the in-memory runtime, plus its event stream.
pub struct TestEngine {
    pub engine: Engine,
    pub events: StateChangeEvents,
    pub runtime: Arc<MockRuntime>,
    pub provisioner: Arc<NoopProvisioner>,
}

impl TestEngine {
    pub async fn start(config: Config) -> Self {
        Self::start_with(config, Arc::new(MockRuntime::new())).await
    }

    pub async fn start_with(config: Config, runtime: Arc<MockRuntime>) -> Self {
        let provisioner = Arc::new(NoopProvisioner::new());
        let (engine, events) = Engine::start(config, runtime.clone(), provisioner.clone())
            .await
            .expect("Failed to start engine");
        Self {
            engine,
            events,
            runtime,
            provisioner,
        }
    }

    pub async fn next_event(&mut self) -> StateChange {
        timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("Timed out waiting for an event")
            .expect("Event stream closed")
    }

    /// Collect events until the task event for `arn` with `status` arrives.
    /// Returns everything received, that event included.
    pub async fn wait_for_task(&mut self, arn: &str, status: TaskStatus) -> Vec<StateChange> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = matches!(&event, StateChange::Task(t) if t.task_arn == arn && t.status == status);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Collect events until every `(arn, status)` task event has arrived.
    pub async fn wait_for_all(&mut self, expected: &[(&str, TaskStatus)]) -> Vec<StateChange> {
        let mut pending: Vec<(&str, TaskStatus)> = expected.to_vec();
        let mut seen = Vec::new();
        while !pending.is_empty() {
            let event = self.next_event().await;
            if let StateChange::Task(t) = &event {
                pending.retain(|(arn, status)| !(t.task_arn == *arn && t.status == *status));
            }
            seen.push(event);
        }
        seen
    }

    /// Poll the engine until the snapshot of `arn` satisfies `check`.
    pub async fn wait_for_snapshot(&self, arn: &str, check: impl Fn(&Task) -> bool) -> Task {
        for _ in 0..500 {
            if let Ok(task) = self.engine.get_task_by_arn(arn).await {
                if check(&task) {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Task {} never reached the expected state", arn);
    }

    /// Poll until `check` holds.
    pub async fn eventually(&self, what: &str, check: impl Fn(&Self) -> bool) {
        for _ in 0..500 {
            if check(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Timed out waiting for {}", what);
    }

    /// Assert that nothing is emitted for `within`.
    pub async fn expect_quiet(&mut self, within: Duration) {
        if let Ok(Some(event)) = timeout(within, self.events.recv()).await {
            panic!("Unexpected event: {:?}", event);
        }
    }
}

/// Compact `type:id:STATUS` rendering of events for ordering assertions.
pub fn describe(events: &[StateChange]) -> Vec<String> {
    events
        .iter()
        .map(|e| format!("{}:{}:{}", e.resource_type(), e.resource_id(), e.status()))
        .collect()
}

pub fn task_events<'a>(events: &'a [StateChange], arn: &str) -> Vec<&'a StateChange> {
    events.iter().filter(|e| e.task_arn() == arn).collect()
}
