//! Managed task - one control loop per admitted task.
//!
//! The loop owns its [`Task`] exclusively. Readers get consistent copies
//! through a `watch` channel that is refreshed after every pass.

use super::transition::{self, StepContext, StepOutcome, StepRequest, TransitionError};
use crate::dependency::{self, DependencyCheck};
use crate::event::{
    AttachmentStateChange, ContainerStateChange, EventError, ManagedAgentStateChange,
    StateChange, TaskStateChange,
};
use crate::model::Task;
use crate::runtime::{RuntimeError, RuntimeState};
use crate::status::{
    AttachmentStatus, ContainerStatus, ManagedAgentStatus, ResourceStatus, TaskStatus,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Reason recorded on a task stopped by one of its essential containers.
pub const ESSENTIAL_EXIT_REASON: &str = "Essential container in task exited";

/// Messages from the engine to a task loop.
#[derive(Debug)]
pub enum TaskMessage {
    /// A newer copy of the task arrived from the control plane.
    Update(Box<Task>),
    Stop,
}

/// Notifications from a task loop back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskNotice {
    /// State changes were emitted; the snapshot is worth persisting.
    Changed { arn: String },
    /// The task's STOPPED event has been emitted.
    Stopped { arn: String },
    /// Containers and resources are gone; the task can be forgotten.
    CleanedUp { arn: String },
}

/// Engine-side handle to a running task loop.
pub struct ManagedTaskHandle {
    pub inbox: mpsc::Sender<TaskMessage>,
    pub snapshot: watch::Receiver<Task>,
    pub join: JoinHandle<()>,
}

/// Channels shared by every task loop.
#[derive(Clone)]
pub struct TaskChannels {
    pub events: mpsc::Sender<StateChange>,
    pub notices: mpsc::UnboundedSender<TaskNotice>,
    pub shutdown: watch::Receiver<bool>,
}

type StepJoin = (String, ContainerStatus, Result<StepOutcome, TransitionError>);

pub struct ManagedTask {
    task: Task,
    ctx: StepContext,
    snapshot: watch::Sender<Task>,
    inbox: mpsc::Receiver<TaskMessage>,
    channels: TaskChannels,
    in_flight: JoinSet<StepJoin>,
    busy: HashSet<String>,
    attempts: HashMap<String, u32>,
    retry_at: HashMap<String, Instant>,
    provision_attempts: u32,
    provision_retry_at: Option<Instant>,
    early_exits: HashMap<String, Option<i32>>,
    stop_notified: bool,
}

impl ManagedTask {
    /// Spawn the loop for `task` and return its handle.
    pub fn spawn(task: Task, ctx: StepContext, channels: TaskChannels) -> ManagedTaskHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(task.clone());
        let managed = ManagedTask {
            stop_notified: task.sent_status() == TaskStatus::Stopped,
            task,
            ctx,
            snapshot: snapshot_tx,
            inbox: inbox_rx,
            channels,
            in_flight: JoinSet::new(),
            busy: HashSet::new(),
            attempts: HashMap::new(),
            retry_at: HashMap::new(),
            provision_attempts: 0,
            provision_retry_at: None,
            early_exits: HashMap::new(),
        };
        let join = tokio::spawn(managed.run());
        ManagedTaskHandle {
            inbox: inbox_tx,
            snapshot: snapshot_rx,
            join,
        }
    }

    async fn run(mut self) {
        let arn = self.task.arn.clone();
        info!("ManagedTask {}: Running", arn);

        if let Err(e) = dependency::validate(&self.task.containers) {
            error!("ManagedTask {}: Invalid task definition: {}", arn, e);
            self.task.set_reason(e.to_string());
            self.task.set_desired_status(TaskStatus::Stopped);
        }

        let mut poll = tokio::time::interval(self.ctx.config.steady_state_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *self.channels.shutdown.borrow() {
                self.abort(&arn);
                return;
            }

            self.reconcile().await;

            if self.task.sent_status() == TaskStatus::Stopped && self.in_flight.is_empty() {
                break;
            }

            let retry_deadline = self
                .retry_at
                .values()
                .chain(self.provision_retry_at.iter())
                .min()
                .copied();
            let polling = self.needs_polling();

            tokio::select! {
                changed = self.channels.shutdown.changed() => {
                    if changed.is_err() || *self.channels.shutdown.borrow() {
                        self.abort(&arn);
                        return;
                    }
                }
                Some(joined) = self.in_flight.join_next() => {
                    match joined {
                        Ok((name, step, outcome)) => self.handle_step(name, step, outcome),
                        Err(e) => error!("ManagedTask {}: Step panicked: {}", arn, e),
                    }
                }
                Some(msg) = self.inbox.recv() => {
                    self.handle_message(msg);
                }
                _ = poll.tick(), if polling => {
                    self.poll_steady_state().await;
                }
                _ = sleep_until(retry_deadline), if retry_deadline.is_some() => {}
            }
        }

        self.cleanup(&arn).await;
    }

    fn abort(&mut self, arn: &str) {
        info!("ManagedTask {}: Shutting down", arn);
        self.in_flight.abort_all();
    }

    fn handle_message(&mut self, msg: TaskMessage) {
        match msg {
            TaskMessage::Update(update) => {
                if update.desired_status() > self.task.desired_status() {
                    info!(
                        "ManagedTask {}: Desired status {} -> {}",
                        self.task.arn,
                        self.task.desired_status(),
                        update.desired_status()
                    );
                    self.task.set_desired_status(update.desired_status());
                }
            }
            TaskMessage::Stop => {
                info!("ManagedTask {}: Stop requested", self.task.arn);
                self.task.set_desired_status(TaskStatus::Stopped);
            }
        }
    }

    /// One full pass: settle statuses, take every allowed step, report.
    async fn reconcile(&mut self) {
        self.emit_events().await;
        self.apply_early_exits();
        propagate_desired(&mut self.task);
        self.provision_resources().await;
        self.schedule_steps();
        self.update_task_status();
        self.emit_events().await;
        self.snapshot.send_replace(self.task.clone());

        if self.task.sent_status() == TaskStatus::Stopped && !self.stop_notified {
            self.stop_notified = true;
            self.notify(TaskNotice::Stopped {
                arn: self.task.arn.clone(),
            });
        }
    }

    fn apply_early_exits(&mut self) {
        for (name, exit_code) in std::mem::take(&mut self.early_exits) {
            info!(
                "ManagedTask {}: Container {} exited with {:?}",
                self.task.arn, name, exit_code
            );
            if let Some(container) = self.task.container_mut(&name) {
                transition::apply(container, Ok(StepOutcome::Stopped { exit_code }));
            }
        }
    }

    async fn provision_resources(&mut self) {
        if self.task.desired_status() == TaskStatus::Stopped {
            self.provision_retry_at = None;
            return;
        }
        if self.provision_retry_at.is_some_and(|t| t > Instant::now()) {
            return;
        }
        self.provision_retry_at = None;

        let mut shutdown = self.channels.shutdown.clone();
        for i in 0..self.task.resources.len() {
            let resource = &self.task.resources[i];
            if resource.known_status >= ResourceStatus::Created
                || resource.desired_status != ResourceStatus::Created
            {
                continue;
            }
            let provisioned = tokio::select! {
                result = transition::provision(&self.ctx, &self.task.arn, resource) => result,
                // The loop notices the shutdown on its next turn.
                _ = shutdown.wait_for(|stop| *stop) => return,
            };
            match provisioned {
                Ok(()) => {
                    debug!(
                        "ManagedTask {}: Resource {} created",
                        self.task.arn, self.task.resources[i].name
                    );
                    self.task.resources[i].known_status = ResourceStatus::Created;
                    self.provision_attempts = 0;
                }
                Err(e)
                    if e.is_retryable()
                        && self.provision_attempts < self.ctx.config.max_transition_retries =>
                {
                    self.provision_attempts += 1;
                    let backoff = self.ctx.config.retry_backoff(self.provision_attempts);
                    warn!(
                        "ManagedTask {}: {} (retry {} in {:?})",
                        self.task.arn, e, self.provision_attempts, backoff
                    );
                    self.provision_retry_at = Some(Instant::now() + backoff);
                    return;
                }
                Err(e) => {
                    error!("ManagedTask {}: {}", self.task.arn, e);
                    self.task.set_reason(e.to_string());
                    self.task.set_desired_status(TaskStatus::Stopped);
                    propagate_desired(&mut self.task);
                    return;
                }
            }
        }
    }

    /// Start every step the dependency graph allows. Steps that need no
    /// runtime call (stopping a container that was never created) are
    /// applied inline, which can unblock further steps in the same pass.
    fn schedule_steps(&mut self) {
        let now = Instant::now();
        // Elapsed deadlines gate nothing and would only wake the loop.
        self.retry_at.retain(|_, deadline| *deadline > now);
        loop {
            let mut progressed = false;
            for i in 0..self.task.containers.len() {
                let container = &self.task.containers[i];
                let name = container.name.clone();
                if self.busy.contains(&name) {
                    continue;
                }
                let Some(step) = transition::next_step(container, container.desired_status()) else {
                    continue;
                };
                let inline_stop = step == ContainerStatus::Stopped && container.runtime_id().is_none();
                if !inline_stop && self.retry_at.contains_key(&name) {
                    continue;
                }

                match dependency::check_transition(container, step, &self.task.containers) {
                    DependencyCheck::Satisfied => {}
                    DependencyCheck::Waiting => continue,
                    DependencyCheck::Unresolvable(reason) => {
                        warn!(
                            "ManagedTask {}: Container {} cannot progress: {}",
                            self.task.arn, name, reason
                        );
                        let container = &mut self.task.containers[i];
                        container.set_reason(reason);
                        container.set_desired_status(ContainerStatus::Stopped);
                        self.forget_retries(&name);
                        progressed = true;
                        continue;
                    }
                }

                if step >= ContainerStatus::Created
                    && step != ContainerStatus::Stopped
                    && !self.task.resources_created()
                {
                    continue;
                }

                if inline_stop {
                    let container = &mut self.task.containers[i];
                    transition::apply(container, Ok(StepOutcome::Stopped { exit_code: None }));
                    self.forget_retries(&name);
                    progressed = true;
                    continue;
                }

                if step == ContainerStatus::Pulled {
                    self.task.mark_pull_started();
                }
                let request = StepRequest::new(
                    &self.task,
                    &self.task.containers[i],
                    step,
                    &self.ctx.config,
                );
                debug!(
                    "ManagedTask {}: Container {} -> {}",
                    self.task.arn, name, step
                );
                let ctx = self.ctx.clone();
                self.retry_at.remove(&name);
                self.busy.insert(name.clone());
                self.in_flight.spawn(async move {
                    let outcome = transition::execute(&request, &ctx).await;
                    (name, step, outcome)
                });
            }
            if !progressed {
                break;
            }
            propagate_desired(&mut self.task);
        }
    }

    fn forget_retries(&mut self, name: &str) {
        self.attempts.remove(name);
        self.retry_at.remove(name);
    }

    fn handle_step(
        &mut self,
        name: String,
        step: ContainerStatus,
        outcome: Result<StepOutcome, TransitionError>,
    ) {
        self.busy.remove(&name);
        let early_exit = match &outcome {
            Ok(StepOutcome::Running {
                exited: Some(code), ..
            }) => Some(*code),
            _ => None,
        };
        let arn = self.task.arn.clone();
        let Some(container) = self.task.container_mut(&name) else {
            return;
        };
        let result = transition::apply(container, outcome);

        let Some(err) = result.error else {
            self.attempts.remove(&name);
            self.retry_at.remove(&name);
            if let Some(code) = early_exit {
                self.early_exits.insert(name, Some(code));
            }
            match step {
                ContainerStatus::Pulled => {
                    if self
                        .task
                        .containers
                        .iter()
                        .all(|c| c.known_status() >= ContainerStatus::Pulled)
                    {
                        self.task.mark_pull_stopped();
                    }
                }
                ContainerStatus::ResourcesProvisioned => {
                    for attachment in &mut self.task.attachments {
                        attachment.status = AttachmentStatus::Attached;
                    }
                }
                _ => {}
            }
            return;
        };

        let attempts = self.attempts.entry(name.clone()).or_default();
        *attempts += 1;
        if result.retryable && *attempts <= self.ctx.config.max_transition_retries {
            let backoff = self.ctx.config.retry_backoff(*attempts);
            warn!(
                "ManagedTask {}: Container {}: {} (retry {} in {:?})",
                arn, name, err, attempts, backoff
            );
            self.retry_at.insert(name, Instant::now() + backoff);
            return;
        }

        error!("ManagedTask {}: Container {}: {}", arn, name, err);
        self.attempts.remove(&name);
        self.retry_at.remove(&name);
        if step == ContainerStatus::Stopped {
            // The runtime would not stop it; stop tracking it anyway.
            transition::apply(container, Ok(StepOutcome::Stopped { exit_code: None }));
        } else {
            container.set_desired_status(ContainerStatus::Stopped);
        }
    }

    fn needs_polling(&self) -> bool {
        self.task.containers.iter().any(|c| {
            c.known_status() >= ContainerStatus::Running
                && c.known_status() < ContainerStatus::Stopped
                && c.runtime_id().is_some()
                && !self.busy.contains(&c.name)
        })
    }

    /// Look at every running container for exits and health changes.
    async fn poll_steady_state(&mut self) {
        let targets: Vec<(String, String)> = self
            .task
            .containers
            .iter()
            .filter(|c| {
                c.known_status() >= ContainerStatus::Running
                    && c.known_status() < ContainerStatus::Stopped
                    && !self.busy.contains(&c.name)
            })
            .filter_map(|c| c.runtime_id().map(|id| (c.name.clone(), id.to_string())))
            .collect();

        for (name, id) in targets {
            match transition::inspect(&self.ctx, &id).await {
                Ok(inspect) => {
                    if let Some(container) = self.task.container_mut(&name) {
                        container.set_health(inspect.health);
                    }
                    if inspect.state == RuntimeState::Exited {
                        self.early_exits.insert(name, inspect.exit_code);
                    }
                }
                Err(RuntimeError::NotFound(_)) => {
                    if let Some(container) = self.task.container_mut(&name) {
                        container.set_reason("container no longer exists in the runtime");
                    }
                    self.early_exits.insert(name, None);
                }
                Err(e) => warn!(
                    "ManagedTask {}: Inspect of {} failed: {}",
                    self.task.arn, name, e
                ),
            }
        }
    }

    fn update_task_status(&mut self) {
        let status = aggregate_status(&self.task);
        if status <= self.task.known_status() {
            return;
        }
        info!(
            "ManagedTask {}: {} -> {}",
            self.task.arn,
            self.task.known_status(),
            status
        );
        if status == TaskStatus::Stopped {
            self.task.mark_execution_stopped();
        }
        self.task.set_known_status(status);
    }

    /// Emit every pending state change, containers first and the task last.
    async fn emit_events(&mut self) {
        let mut emitted = false;

        for i in 0..self.task.containers.len() {
            let known = self.task.containers[i].known_status();
            let agent_status = if known == ContainerStatus::Stopped {
                Some(ManagedAgentStatus::Stopped)
            } else if known >= ContainerStatus::Running {
                Some(ManagedAgentStatus::Running)
            } else {
                None
            };
            if let Some(status) = agent_status {
                for agent in &mut self.task.containers[i].managed_agents {
                    if agent.status < status {
                        agent.status = status;
                    }
                }
            }

            let event = ContainerStateChange::new(&self.task, &self.task.containers[i], None);
            if let Some(event) = self.filter(event.map(StateChange::Container)) {
                self.send(event).await;
                self.task.containers[i].set_sent_status(known);
                emitted = true;
            }

            for j in 0..self.task.containers[i].managed_agents.len() {
                let container = &self.task.containers[i];
                let event =
                    ManagedAgentStateChange::new(&self.task, container, &container.managed_agents[j]);
                if let Some(event) = self.filter(event.map(StateChange::ManagedAgent)) {
                    self.send(event).await;
                    let agent = &mut self.task.containers[i].managed_agents[j];
                    agent.sent_status = agent.status;
                    emitted = true;
                }
            }
        }

        for i in 0..self.task.attachments.len() {
            let event = AttachmentStateChange::new(&self.task, &self.task.attachments[i]);
            if let Some(event) = self.filter(event.map(StateChange::Attachment)) {
                self.send(event).await;
                self.task.attachments[i].sent = true;
                emitted = true;
            }
        }

        let known = self.task.known_status();
        if let Some(event) = self.filter(TaskStateChange::new(&self.task).map(StateChange::Task)) {
            self.send(event).await;
            self.task.set_sent_status(known);
            emitted = true;
        }

        if emitted {
            self.notify(TaskNotice::Changed {
                arn: self.task.arn.clone(),
            });
        }
    }

    fn filter(&self, event: Result<StateChange, EventError>) -> Option<StateChange> {
        match event {
            Ok(event) => Some(event),
            Err(EventError::AlreadySent { .. }) => None,
            Err(e) => {
                debug!("ManagedTask {}: Not reporting: {}", self.task.arn, e);
                None
            }
        }
    }

    async fn send(&self, event: StateChange) {
        info!(
            "ManagedTask {}: Emitting {} {} {}",
            self.task.arn,
            event.resource_type(),
            event.resource_id(),
            event.status()
        );
        if self.channels.events.send(event).await.is_err() {
            debug!("ManagedTask {}: Event receiver dropped", self.task.arn);
        }
    }

    async fn cleanup(&mut self, arn: &str) {
        let wait = self.ctx.config.task_cleanup_wait;
        info!("ManagedTask {}: Stopped, cleaning up in {:?}", arn, wait);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.channels.shutdown.changed() => {
                self.abort(arn);
                return;
            }
        }

        for container in &self.task.containers {
            let Some(id) = container.runtime_id() else {
                continue;
            };
            if let Err(e) = transition::remove(&self.ctx, id).await {
                warn!(
                    "ManagedTask {}: Could not remove container {}: {}",
                    arn, container.name, e
                );
            }
        }

        for resource in &mut self.task.resources {
            if resource.known_status != ResourceStatus::Created {
                continue;
            }
            if let Err(e) = transition::release(&self.ctx, arn, resource).await {
                warn!("ManagedTask {}: {}", arn, e);
            }
            resource.known_status = ResourceStatus::Removed;
        }

        if self.task.pause_container().is_some() {
            if let Err(e) = transition::teardown_network(&self.ctx, arn).await {
                warn!("ManagedTask {}: {}", arn, e);
            }
        }
        for attachment in &mut self.task.attachments {
            attachment.status = AttachmentStatus::Detached;
        }

        self.snapshot.send_replace(self.task.clone());
        info!("ManagedTask {}: Cleaned up", arn);
        self.notify(TaskNotice::CleanedUp {
            arn: arn.to_string(),
        });
    }

    fn notify(&self, notice: TaskNotice) {
        if let Err(e) = self.channels.notices.send(notice) {
            debug!(
                "ManagedTask {}: Engine is gone, dropping {:?}",
                self.task.arn, e.0
            );
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Push desired statuses down to containers.
///
/// A stopped essential container stops the whole task; a task that should
/// stop stops every container.
pub fn propagate_desired(task: &mut Task) {
    let essential_stopped = task
        .containers
        .iter()
        .find(|c| c.essential && c.known_status() == ContainerStatus::Stopped)
        .map(|c| c.name.clone());
    if let Some(name) = essential_stopped {
        if task.desired_status() < TaskStatus::Stopped {
            info!(
                "Task {}: Essential container {} stopped, stopping task",
                task.arn, name
            );
            task.set_reason(ESSENTIAL_EXIT_REASON);
            task.set_desired_status(TaskStatus::Stopped);
        }
    }

    let desired = task.desired_status();
    for container in &mut task.containers {
        let target = desired.container_target(container.steady_state());
        container.set_desired_status(target);
    }
}

/// Aggregate container statuses into a task status.
pub fn aggregate_status(task: &Task) -> TaskStatus {
    let containers = &task.containers;
    if containers.is_empty() {
        return if task.desired_status() == TaskStatus::Stopped {
            TaskStatus::Stopped
        } else {
            TaskStatus::Running
        };
    }
    if task.all_containers_stopped() {
        return TaskStatus::Stopped;
    }

    // A task that is being stopped never becomes RUNNING.
    let running = task.desired_status() < TaskStatus::Stopped
        && containers.iter().all(|c| {
            if c.known_status() >= c.steady_state() {
                return true;
            }
            if c.essential || c.is_internal() {
                return false;
            }
            if c.desired_status() == ContainerStatus::Stopped {
                return true;
            }
            // Non-essential containers held back by their dependencies count
            // as having attempted to start.
            transition::next_step(c, c.desired_status()).is_some_and(|step| {
                step > ContainerStatus::ManifestPulled
                    && dependency::check_transition(c, step, containers)
                        == DependencyCheck::Waiting
            })
        });
    if running {
        return TaskStatus::Running;
    }

    let min = containers
        .iter()
        .map(|c| c.known_status())
        .min()
        .unwrap_or_default();
    match min {
        // One resolved digest is enough to report the manifest pull.
        ContainerStatus::None if task.has_resolved_digest() => TaskStatus::ManifestPulled,
        ContainerStatus::None => TaskStatus::None,
        ContainerStatus::ManifestPulled | ContainerStatus::Pulled => TaskStatus::ManifestPulled,
        _ => TaskStatus::Created,
    }
}
