//! Engine tests against the in-memory runtime.
//!
//! Run with: cargo test -p hostagent --test engine_test

mod common;

use common::{TestEngine, describe, simple_task, task_events, test_config};
use hostagent::engine::ESSENTIAL_EXIT_REASON;
use hostagent::model::{
    Attachment, Container, ContainerKind, DependencyCondition, LaunchType, ResourceKind,
    TaskResource,
};
use hostagent::runtime::{MockRuntime, Operation, RuntimeError};
use hostagent::state::EngineState;
use hostagent::{ContainerStatus, EngineError, StateChange, Task, TaskStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn container_event<'a>(events: &'a [StateChange], name: &str, status: ContainerStatus) -> &'a hostagent::event::ContainerStateChange {
    events
        .iter()
        .find_map(|e| match e {
            StateChange::Container(c) if c.container_name == name && c.status == status => Some(c),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no {} event for {}", status, name))
}

fn position(events: &[String], wanted: &str) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .unwrap_or_else(|| panic!("{} not in {:?}", wanted, events))
}

/// Test: a single container task runs and stops, reporting each status once.
#[tokio::test]
async fn test_task_lifecycle() {
    let mut t = TestEngine::start(test_config()).await;
    t.engine.add_task(simple_task("arn:task/1", 512, 512)).await.unwrap();

    let events = t.wait_for_task("arn:task/1", TaskStatus::Running).await;
    assert_eq!(
        describe(&events),
        vec![
            "container:web:MANIFEST_PULLED",
            "task:arn:task/1:MANIFEST_PULLED",
            "container:web:RUNNING",
            "task:arn:task/1:RUNNING",
        ]
    );
    let running = container_event(&events, "web", ContainerStatus::Running);
    assert!(running.runtime_id.is_some());
    assert!(running.image_digest.as_deref().unwrap().starts_with("sha256:"));
    assert!(t.engine.is_consuming("arn:task/1"));
    assert_eq!(t.engine.used_resources(), (512, 512));

    assert!(t.engine.stop_task("arn:task/1").await.unwrap());
    let stopped = t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;
    assert_eq!(
        describe(&stopped),
        vec!["container:web:STOPPED", "task:arn:task/1:STOPPED"]
    );
    let web = container_event(&stopped, "web", ContainerStatus::Stopped);
    assert_eq!(web.exit_code, Some(143));
    match stopped.last().unwrap() {
        StateChange::Task(task) => {
            assert!(task.pull_started_at.is_some());
            assert!(task.pull_stopped_at.is_some());
            assert!(task.execution_stopped_at.is_some());
        }
        other => panic!("expected a task event, got {:?}", other),
    }

    t.eventually("resources released", |t| !t.engine.is_consuming("arn:task/1"))
        .await;
    assert_eq!(t.engine.used_resources(), (0, 0));
    t.expect_quiet(Duration::from_millis(100)).await;

    let all: Vec<String> = describe(&events).into_iter().chain(describe(&stopped)).collect();
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(unique.len(), all.len(), "duplicate events: {:?}", all);
}

/// Test: the snapshot follows the task and unknown lookups fail.
#[tokio::test]
async fn test_get_task_by_arn() {
    let mut t = TestEngine::start(test_config()).await;
    t.engine.add_task(simple_task("arn:task/1", 256, 256)).await.unwrap();
    t.wait_for_task("arn:task/1", TaskStatus::Running).await;

    let task = t
        .wait_for_snapshot("arn:task/1", |task| task.known_status() == TaskStatus::Running)
        .await;
    let web = task.container("web").unwrap();
    assert_eq!(web.known_status(), ContainerStatus::Running);
    assert_eq!(web.sent_status(), ContainerStatus::Running);

    assert!(matches!(
        t.engine.get_task_by_arn("arn:task/missing").await,
        Err(EngineError::TaskNotFound(_))
    ));
    assert_eq!(t.engine.list_tasks().await.unwrap().len(), 1);
}

/// Test: queued tasks are admitted strictly in arrival order.
#[tokio::test]
async fn test_fifo_admission() {
    let mut t = TestEngine::start(test_config()).await;
    t.engine.add_task(simple_task("arn:a", 768, 512)).await.unwrap();
    t.engine.add_task(simple_task("arn:b", 512, 512)).await.unwrap();
    // Would fit, but must not overtake b.
    t.engine.add_task(simple_task("arn:c", 128, 128)).await.unwrap();

    assert!(t.engine.is_consuming("arn:a"));
    assert!(!t.engine.is_consuming("arn:b"));
    assert!(!t.engine.is_consuming("arn:c"));
    assert_eq!(t.engine.top_queued_task().unwrap().arn, "arn:b");
    let queued: Vec<String> = t.engine.queued_tasks().into_iter().map(|t| t.arn).collect();
    assert_eq!(queued, vec!["arn:b", "arn:c"]);

    t.wait_for_task("arn:a", TaskStatus::Running).await;
    t.engine.stop_task("arn:a").await.unwrap();

    let events = t
        .wait_for_all(&[
            ("arn:a", TaskStatus::Stopped),
            ("arn:b", TaskStatus::Running),
            ("arn:c", TaskStatus::Running),
        ])
        .await;
    let rendered = describe(&events);
    assert!(position(&rendered, "task:arn:a:STOPPED") < position(&rendered, "task:arn:b:MANIFEST_PULLED"));
    assert!(t.engine.top_queued_task().is_none());
    assert!(t.engine.is_consuming("arn:b"));
    assert!(t.engine.is_consuming("arn:c"));
    assert_eq!(t.engine.used_resources(), (640, 640));
}

/// Test: stopping a queued task never touches the runtime.
#[tokio::test]
async fn test_stop_queued_task() {
    let mut t = TestEngine::start(test_config()).await;
    t.engine.add_task(simple_task("arn:big", 1024, 1024)).await.unwrap();
    let waiting = Task::new("arn:waiting", vec![Container::new("worker", "busybox:latest")])
        .with_resources(512, 512);
    t.engine.add_task(waiting).await.unwrap();
    assert_eq!(t.engine.top_queued_task().unwrap().arn, "arn:waiting");

    assert!(t.engine.stop_task("arn:waiting").await.unwrap());
    let events = t.wait_for_task("arn:waiting", TaskStatus::Stopped).await;
    let own: Vec<StateChange> = task_events(&events, "arn:waiting").into_iter().cloned().collect();
    assert_eq!(
        describe(&own),
        vec!["container:worker:STOPPED", "task:arn:waiting:STOPPED"]
    );

    assert!(t.engine.top_queued_task().is_none());
    assert!(!t.engine.is_consuming("arn:waiting"));
    assert!(t.engine.is_consuming("arn:big"));
    assert_eq!(t.runtime.calls_for(Operation::PullManifest, "busybox:latest"), 0);
    assert_eq!(t.runtime.calls_for(Operation::Create, "worker"), 0);
}

/// Test: an update for a queued task raises its desired status in place.
#[tokio::test]
async fn test_update_queued_task() {
    let t = TestEngine::start(test_config()).await;
    t.engine.add_task(simple_task("arn:big", 1024, 1024)).await.unwrap();
    let waiting = simple_task("arn:waiting", 512, 512).with_desired_status(TaskStatus::Created);
    t.engine.add_task(waiting).await.unwrap();

    t.engine
        .add_task(simple_task("arn:waiting", 512, 512))
        .await
        .unwrap();
    let queued = t.engine.top_queued_task().unwrap();
    assert_eq!(queued.arn, "arn:waiting");
    assert_eq!(queued.desired_status(), TaskStatus::Running);
    assert_eq!(t.engine.queued_tasks().len(), 1);
    assert!(!t.engine.is_consuming("arn:waiting"));
}

/// Test: stop requests for unknown tasks are ignored.
#[tokio::test]
async fn test_stop_unknown_task() {
    let mut t = TestEngine::start(test_config()).await;
    assert!(!t.engine.stop_task("arn:nope").await.unwrap());

    let stopped = simple_task("arn:nope", 1, 1).with_desired_status(TaskStatus::Stopped);
    t.engine.add_task(stopped).await.unwrap();
    assert!(t.engine.list_tasks().await.unwrap().is_empty());
    t.expect_quiet(Duration::from_millis(100)).await;
}

/// Test: adding the same task twice does not count it twice.
#[tokio::test]
async fn test_duplicate_add() {
    let mut t = TestEngine::start(test_config()).await;
    t.engine.add_task(simple_task("arn:task/1", 300, 300)).await.unwrap();
    t.engine.add_task(simple_task("arn:task/1", 300, 300)).await.unwrap();
    t.wait_for_task("arn:task/1", TaskStatus::Running).await;
    assert_eq!(t.engine.used_resources(), (300, 300));
    assert_eq!(t.engine.list_tasks().await.unwrap().len(), 1);
}

/// Test: exempt launch types skip the ledger and the queue.
#[tokio::test]
async fn test_exempt_launch_type() {
    let mut t = TestEngine::start(test_config()).await;
    t.engine.add_task(simple_task("arn:ec2", 1024, 2048)).await.unwrap();

    let fargate = simple_task("arn:fargate", 4096, 8192).with_launch_type(LaunchType::Fargate);
    t.engine.add_task(fargate).await.unwrap();

    t.wait_for_all(&[
        ("arn:ec2", TaskStatus::Running),
        ("arn:fargate", TaskStatus::Running),
    ])
    .await;
    assert!(!t.engine.is_consuming("arn:fargate"));
    assert!(t.engine.top_queued_task().is_none());
    assert_eq!(t.engine.used_resources(), (1024, 2048));
}

/// Test: a task larger than the host is stopped instead of queued forever.
#[tokio::test]
async fn test_task_exceeding_host_capacity() {
    let mut t = TestEngine::start(test_config()).await;
    t.engine.add_task(simple_task("arn:huge", 4096, 512)).await.unwrap();

    let events = t.wait_for_task("arn:huge", TaskStatus::Stopped).await;
    match events.last().unwrap() {
        StateChange::Task(task) => assert!(task.reason.is_some()),
        other => panic!("expected a task event, got {:?}", other),
    }
    assert!(t.engine.top_queued_task().is_none());
    assert_eq!(t.runtime.call_count(Operation::PullManifest), 0);
}

/// Test: container totals that overflow stop the task and leave the engine usable.
#[tokio::test]
async fn test_overflowing_requirements_stop_task() {
    let mut t = TestEngine::start(test_config()).await;
    let task = Task::new(
        "arn:overflow",
        vec![
            Container::new("a", "app:1").with_resources(u64::MAX, 16),
            Container::new("b", "app:1").with_resources(2, 16),
        ],
    );
    t.engine.add_task(task).await.unwrap();

    let events = t.wait_for_task("arn:overflow", TaskStatus::Stopped).await;
    match events.last().unwrap() {
        StateChange::Task(task) => assert!(
            task.reason.as_deref().unwrap().contains("overflow"),
            "{:?}",
            task.reason
        ),
        other => panic!("expected a task event, got {:?}", other),
    }
    assert!(!t.engine.is_consuming("arn:overflow"));
    assert_eq!(t.engine.used_resources(), (0, 0));

    t.engine.add_task(simple_task("arn:next", 256, 256)).await.unwrap();
    t.wait_for_task("arn:next", TaskStatus::Running).await;
    assert_eq!(t.engine.list_tasks().await.unwrap().len(), 2);
}

/// Test: an essential container exiting stops the rest of the task.
#[tokio::test]
async fn test_essential_container_exit() {
    let mut t = TestEngine::start(test_config()).await;
    let task = Task::new(
        "arn:task/1",
        vec![
            Container::new("app", "app:1"),
            Container::new("sidecar", "proxy:1").with_essential(false),
        ],
    )
    .with_resources(256, 256);
    t.engine.add_task(task).await.unwrap();
    t.wait_for_task("arn:task/1", TaskStatus::Running).await;

    t.runtime.exit_container("app", 1);
    let events = t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;
    let rendered = describe(&events);
    assert!(position(&rendered, "container:app:STOPPED") < position(&rendered, "container:sidecar:STOPPED"));
    assert_eq!(rendered.last().unwrap(), "task:arn:task/1:STOPPED");

    assert_eq!(container_event(&events, "app", ContainerStatus::Stopped).exit_code, Some(1));
    assert_eq!(container_event(&events, "sidecar", ContainerStatus::Stopped).exit_code, Some(143));
    match events.last().unwrap() {
        StateChange::Task(task) => assert_eq!(task.reason.as_deref(), Some(ESSENTIAL_EXIT_REASON)),
        other => panic!("expected a task event, got {:?}", other),
    }
}

/// Test: a non-essential container exiting leaves the task running.
#[tokio::test]
async fn test_non_essential_container_exit() {
    let mut t = TestEngine::start(test_config()).await;
    let task = Task::new(
        "arn:task/1",
        vec![
            Container::new("app", "app:1"),
            Container::new("sidecar", "proxy:1").with_essential(false),
        ],
    );
    t.engine.add_task(task).await.unwrap();
    t.wait_for_task("arn:task/1", TaskStatus::Running).await;

    t.runtime.exit_container("sidecar", 0);
    let event = t.next_event().await;
    assert_eq!(describe(&[event]), vec!["container:sidecar:STOPPED"]);
    t.expect_quiet(Duration::from_millis(200)).await;

    let task = t.engine.get_task_by_arn("arn:task/1").await.unwrap();
    assert_eq!(task.desired_status(), TaskStatus::Running);
    assert_eq!(t.runtime.running_containers(), vec!["app".to_string()]);
}

/// Test: a SUCCESS dependency holds back everything after the manifest pull.
#[tokio::test]
async fn test_success_dependency_ordering() {
    let mut t = TestEngine::start(test_config()).await;
    t.runtime.exit_on_start("init", 0);
    let task = Task::new(
        "arn:task/1",
        vec![
            Container::new("init", "migrate:1").with_essential(false),
            Container::new("app", "app:1").with_dependency("init", DependencyCondition::Success),
        ],
    );
    t.engine.add_task(task).await.unwrap();
    let events = t.wait_for_task("arn:task/1", TaskStatus::Running).await;

    let calls: Vec<String> = t
        .runtime
        .calls()
        .into_iter()
        .map(|c| format!("{:?}:{}", c.operation, c.target))
        .collect();
    let init_started = position(&calls, "Start:init");
    assert!(position(&calls, "PullManifest:app:1") < init_started);
    assert!(position(&calls, "PullImage:app:1") > init_started);
    assert!(position(&calls, "Create:app") > init_started);

    let rendered = describe(&events);
    assert!(position(&rendered, "container:init:STOPPED") < position(&rendered, "container:app:RUNNING"));
    assert_eq!(container_event(&events, "init", ContainerStatus::Stopped).exit_code, Some(0));
}

/// Test: a failed SUCCESS dependency stops the dependent without creating it.
#[tokio::test]
async fn test_failed_success_dependency() {
    let mut t = TestEngine::start(test_config()).await;
    t.runtime.exit_on_start("init", 2);
    let task = Task::new(
        "arn:task/1",
        vec![
            Container::new("init", "migrate:1").with_essential(false),
            Container::new("app", "app:1").with_dependency("init", DependencyCondition::Success),
        ],
    );
    t.engine.add_task(task).await.unwrap();
    let events = t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;

    assert_eq!(t.runtime.calls_for(Operation::Create, "app"), 0);
    let app = container_event(&events, "app", ContainerStatus::Stopped);
    assert!(app.reason.is_some());
    assert!(!describe(&events).contains(&"task:arn:task/1:RUNNING".to_string()));
}

/// Test: a task whose dependency graph has a cycle is rejected and stopped.
#[tokio::test]
async fn test_dependency_cycle_rejected() {
    let mut t = TestEngine::start(test_config()).await;
    let task = Task::new(
        "arn:task/1",
        vec![
            Container::new("a", "busybox:latest").with_dependency("b", DependencyCondition::Start),
            Container::new("b", "busybox:latest").with_dependency("a", DependencyCondition::Start),
        ],
    )
    .with_resources(128, 128);

    let err = t.engine.add_task(task).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTask { .. }));

    let events = t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;
    match events.last().unwrap() {
        StateChange::Task(task) => assert!(task.reason.as_deref().unwrap().contains("cycle")),
        other => panic!("expected a task event, got {:?}", other),
    }
    assert!(!t.engine.is_consuming("arn:task/1"));
    assert!(t.runtime.calls().is_empty());
}

fn networked_task() -> Task {
    let mut task = Task::new(
        "arn:task/1",
        vec![
            Container::new("pause", "pause:3.9").with_kind(ContainerKind::Pause),
            Container::new("app", "app:1").with_managed_agent("ExecuteCommandAgent"),
        ],
    );
    task.resources.push(TaskResource::new("data", ResourceKind::Volume));
    task.attachments.push(Attachment::new("arn:eni/1"));
    task
}

/// Test: network container, attachment, managed agent and volume lifecycle.
#[tokio::test]
async fn test_networked_task_lifecycle() {
    let mut config = test_config();
    config.task_cleanup_wait = Duration::from_millis(50);
    let mut t = TestEngine::start(config).await;
    t.engine.add_task(networked_task()).await.unwrap();

    let events = t.wait_for_task("arn:task/1", TaskStatus::Running).await;
    let rendered = describe(&events);
    assert!(rendered.iter().all(|e| !e.contains(":pause:")), "{:?}", rendered);
    assert!(position(&rendered, "attachment:arn:eni/1:ATTACHED") < position(&rendered, "container:app:RUNNING"));
    assert!(position(&rendered, "container:app:RUNNING") < position(&rendered, "managed_agent:ExecuteCommandAgent:RUNNING"));

    let calls: Vec<String> = t
        .runtime
        .calls()
        .into_iter()
        .map(|c| format!("{:?}:{}", c.operation, c.target))
        .collect();
    assert!(position(&calls, "Start:pause") < position(&calls, "Create:app"));

    t.engine.stop_task("arn:task/1").await.unwrap();
    let events = t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;
    assert!(describe(&events).contains(&"managed_agent:ExecuteCommandAgent:STOPPED".to_string()));

    let calls: Vec<String> = t
        .runtime
        .calls()
        .into_iter()
        .map(|c| format!("{:?}:{}", c.operation, c.target))
        .collect();
    assert!(position(&calls, "Stop:app") < position(&calls, "Stop:pause"));

    t.eventually("volume released", |t| t.provisioner.released() == vec!["data".to_string()])
        .await;
}

/// Test: a failed resource stops the task before any container is created.
#[tokio::test]
async fn test_resource_provisioning_failure() {
    let mut t = TestEngine::start(test_config()).await;
    t.provisioner.fail_resource("data");
    t.engine.add_task(networked_task()).await.unwrap();

    let events = t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;
    match events.last().unwrap() {
        StateChange::Task(task) => assert!(
            task.reason.as_deref().unwrap().contains("failed to provision resource data"),
            "{:?}",
            task.reason
        ),
        other => panic!("expected a task event, got {:?}", other),
    }
    assert_eq!(t.runtime.call_count(Operation::Create), 0);
}

/// Test: a hung provisioner times out, is retried, then stops the task.
#[tokio::test]
async fn test_provisioning_timeout() {
    let mut config = test_config();
    config.provision_timeout = Duration::from_millis(50);
    config.max_transition_retries = 2;
    let mut t = TestEngine::start(config).await;
    t.provisioner.set_delay(Duration::from_secs(30));
    t.engine.add_task(networked_task()).await.unwrap();

    let events = tokio::time::timeout(
        Duration::from_secs(3),
        t.wait_for_task("arn:task/1", TaskStatus::Stopped),
    )
    .await
    .expect("provisioning was never given up");
    match events.last().unwrap() {
        StateChange::Task(task) => assert!(
            task.reason.as_deref().unwrap().contains("timed out"),
            "{:?}",
            task.reason
        ),
        other => panic!("expected a task event, got {:?}", other),
    }
    assert_eq!(t.provisioner.provision_attempts(), vec!["data"; 3]);
    assert_eq!(t.runtime.call_count(Operation::Create), 0);
}

/// Test: a transient runtime failure is retried.
#[tokio::test]
async fn test_transient_failure_retried() {
    let mut t = TestEngine::start(test_config()).await;
    t.runtime.fail_next(
        Operation::Create,
        "web",
        RuntimeError::Unavailable("daemon restarting".into()),
    );
    t.engine.add_task(simple_task("arn:task/1", 128, 128)).await.unwrap();
    t.wait_for_task("arn:task/1", TaskStatus::Running).await;
    assert_eq!(t.runtime.calls_for(Operation::Create, "web"), 2);
}

/// Test: a rejected create stops the task with the transition error.
#[tokio::test]
async fn test_rejected_create_stops_task() {
    let mut t = TestEngine::start(test_config()).await;
    t.runtime.fail_always(
        Operation::Create,
        "web",
        RuntimeError::Rejected("invalid mount".into()),
    );
    t.engine.add_task(simple_task("arn:task/1", 128, 128)).await.unwrap();
    let events = t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;

    assert_eq!(t.runtime.calls_for(Operation::Create, "web"), 1);
    let web = container_event(&events, "web", ContainerStatus::Stopped);
    assert!(
        web.reason.as_deref().unwrap().contains("Could not transition to CREATED"),
        "{:?}",
        web.reason
    );
}

/// Test: a manifest pull that hangs times out with a descriptive reason.
#[tokio::test]
async fn test_manifest_pull_timeout() {
    let mut config = test_config();
    config.manifest_pull_timeout = Duration::from_millis(50);
    config.max_transition_retries = 0;
    let mut t = TestEngine::start(config).await;
    t.runtime.set_delay(Operation::PullManifest, Duration::from_secs(2));

    t.engine.add_task(simple_task("arn:task/1", 128, 128)).await.unwrap();
    let events = t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;

    let web = container_event(&events, "web", ContainerStatus::Stopped);
    let reason = web.reason.as_deref().unwrap();
    assert!(
        reason.contains("Could not transition to MANIFEST_PULLED; timed out"),
        "{}",
        reason
    );
    assert_eq!(t.runtime.call_count(Operation::PullImage), 0);
}

/// Test: stopped tasks are cleaned up and forgotten after the wait.
#[tokio::test]
async fn test_cleanup_after_stop() {
    let mut config = test_config();
    config.task_cleanup_wait = Duration::from_millis(50);
    let mut t = TestEngine::start(config).await;

    t.engine.add_task(simple_task("arn:task/1", 128, 128)).await.unwrap();
    t.wait_for_task("arn:task/1", TaskStatus::Running).await;
    assert_eq!(t.runtime.container_names(), vec!["web".to_string()]);

    t.engine.stop_task("arn:task/1").await.unwrap();
    t.wait_for_task("arn:task/1", TaskStatus::Stopped).await;

    t.eventually("containers removed", |t| t.runtime.container_names().is_empty())
        .await;
    for _ in 0..100 {
        if t.engine.list_tasks().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(t.engine.list_tasks().await.unwrap().is_empty());
    assert_eq!(t.runtime.calls_for(Operation::Remove, "web"), 1);
}

/// Test: state survives a restart without double counting or re-reporting.
#[tokio::test]
async fn test_restart_from_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.state_file = Some(dir.path().join("state.json"));
    let runtime = Arc::new(MockRuntime::new());

    let mut first = TestEngine::start_with(config.clone(), runtime.clone()).await;
    first.engine.add_task(simple_task("arn:a", 1024, 1024)).await.unwrap();
    first.engine.add_task(simple_task("arn:b", 512, 512)).await.unwrap();
    first.wait_for_task("arn:a", TaskStatus::Running).await;
    first.engine.shutdown().await.unwrap();
    assert!(dir.path().join("state.json").exists());

    let mut second = TestEngine::start_with(config, runtime.clone()).await;
    assert!(second.engine.is_consuming("arn:a"));
    assert_eq!(second.engine.used_resources(), (1024, 1024));
    assert_eq!(second.engine.top_queued_task().unwrap().arn, "arn:b");
    second.expect_quiet(Duration::from_millis(200)).await;

    let a = second.engine.get_task_by_arn("arn:a").await.unwrap();
    assert_eq!(a.sent_status(), TaskStatus::Running);
    assert_eq!(runtime.calls_for(Operation::Create, "web"), 1);

    second.engine.stop_task("arn:a").await.unwrap();
    second
        .wait_for_all(&[
            ("arn:a", TaskStatus::Stopped),
            ("arn:b", TaskStatus::Running),
        ])
        .await;
    assert_eq!(second.engine.used_resources(), (512, 512));
}

/// Test: shutdown cancels in-flight pulls and leaves the tasks resumable.
#[tokio::test]
async fn test_shutdown_cancels_pending_calls() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let mut config = test_config();
    config.state_file = Some(path.clone());

    let mut first = TestEngine::start(config.clone()).await;
    first.runtime.set_delay(Operation::PullImage, Duration::from_secs(30));
    first.engine.add_task(simple_task("arn:a", 512, 512)).await.unwrap();
    first.engine.add_task(simple_task("arn:b", 512, 512)).await.unwrap();
    first
        .wait_for_all(&[
            ("arn:a", TaskStatus::ManifestPulled),
            ("arn:b", TaskStatus::ManifestPulled),
        ])
        .await;
    first
        .eventually("both image pulls in flight", |t| {
            t.runtime.calls_for(Operation::PullImage, "nginx:latest") == 2
        })
        .await;

    let started = Instant::now();
    first.engine.shutdown().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "shutdown took {:?}",
        started.elapsed()
    );

    let state = EngineState::load(&path).await.unwrap().unwrap();
    assert_eq!(state.tasks.len(), 2);
    for task in &state.tasks {
        assert_eq!(task.desired_status(), TaskStatus::Running);
        assert_eq!(task.sent_status(), TaskStatus::ManifestPulled);
        assert_eq!(
            task.container("web").unwrap().known_status(),
            ContainerStatus::ManifestPulled
        );
    }

    let mut second = TestEngine::start(config).await;
    second
        .wait_for_all(&[
            ("arn:a", TaskStatus::Running),
            ("arn:b", TaskStatus::Running),
        ])
        .await;
    assert_eq!(second.engine.used_resources(), (1024, 1024));
}

/// Test: the handle reports a stopped engine.
#[tokio::test]
async fn test_shutdown() {
    let t = TestEngine::start(test_config()).await;
    t.engine.shutdown().await.unwrap();
    assert!(matches!(
        t.engine.list_tasks().await,
        Err(EngineError::NotRunning)
    ));
}
