//! Engine Dispatcher - admission, registry and persistence.

use super::Command;
use super::managed_task::{ManagedTask, ManagedTaskHandle, TaskChannels, TaskMessage, TaskNotice};
use super::transition::StepContext;
use crate::dependency;
use crate::error::{EngineError, Result};
use crate::model::Task;
use crate::queue::WaitingQueue;
use crate::resources::{HostResourceManager, ResourceRequirements};
use crate::state::EngineState;
use crate::status::TaskStatus;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// How long shutdown waits for a task loop to exit.
const TASK_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EngineDispatcher {
    command_rx: mpsc::Receiver<Command>,
    notice_rx: mpsc::UnboundedReceiver<TaskNotice>,
    channels: TaskChannels,
    shutdown_tx: watch::Sender<bool>,
    ctx: StepContext,
    tasks: HashMap<String, ManagedTaskHandle>,
    resources: Arc<HostResourceManager>,
    queue: Arc<WaitingQueue>,
    state_file: Option<PathBuf>,
}

impl EngineDispatcher {
    pub fn new(
        command_rx: mpsc::Receiver<Command>,
        events_tx: mpsc::Sender<crate::event::StateChange>,
        ctx: StepContext,
        resources: Arc<HostResourceManager>,
        queue: Arc<WaitingQueue>,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_file = ctx.config.state_file.clone();
        Self {
            command_rx,
            notice_rx,
            channels: TaskChannels {
                events: events_tx,
                notices: notice_tx,
                shutdown: shutdown_rx,
            },
            shutdown_tx,
            ctx,
            tasks: HashMap::new(),
            resources,
            queue,
            state_file,
        }
    }

    /// Rebuild the registry, ledger and queue from a snapshot.
    pub fn restore(&mut self, state: EngineState) {
        info!(
            "EngineDispatcher: Restoring {} tasks, {} queued",
            state.tasks.len(),
            state.queue.len()
        );
        self.resources.restore(state.consumed);
        for task in state.queue {
            self.queue.enqueue(task);
        }
        for task in state.tasks {
            // Stopped tasks may have been saved before their release.
            if task.sent_status() == TaskStatus::Stopped {
                self.resources.release(&task.arn);
            }
            self.spawn(task);
        }
    }

    /// Run the dispatcher loop.
    pub async fn run(mut self) {
        info!("EngineDispatcher: Running and waiting for commands");

        let mut checkpoint = tokio::time::interval(self.ctx.config.checkpoint_interval);
        checkpoint.tick().await;
        self.admit_waiting();

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { responder }) => {
                            self.shutdown().await;
                            let _ = responder.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(notice) = self.notice_rx.recv() => {
                    self.handle_notice(notice).await;
                }
                _ = checkpoint.tick() => {
                    self.persist().await;
                }
            }
        }

        info!("EngineDispatcher: Shutting down");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddTask { task, responder } => {
                let result = self.add_task(*task).await;
                self.persist().await;
                let _ = responder.send(result);
            }
            Command::StopTask { arn, responder } => {
                let known = self.stop_task(&arn).await;
                self.persist().await;
                let _ = responder.send(known);
            }
            Command::ListTasks { responder } => {
                let _ = responder.send(self.list_tasks());
            }
            Command::GetTask { arn, responder } => {
                let _ = responder.send(self.get_task(&arn));
            }
            Command::SaveState { responder } => {
                let _ = responder.send(self.save().await);
            }
            Command::Shutdown { responder } => {
                let _ = responder.send(());
            }
        }
    }

    async fn add_task(&mut self, mut task: Task) -> Result<()> {
        let arn = task.arn.clone();

        if let Some(handle) = self.tasks.get(&arn) {
            info!("EngineDispatcher: Updating task {}", arn);
            if handle
                .inbox
                .send(TaskMessage::Update(Box::new(task)))
                .await
                .is_err()
            {
                warn!("EngineDispatcher: Task {} loop is gone", arn);
            }
            return Ok(());
        }

        if self.queue.contains(&arn) {
            let desired = task.desired_status();
            if desired == TaskStatus::Stopped {
                self.stop_queued(&arn);
            } else {
                self.queue.update(&arn, |queued| {
                    queued.set_desired_status(desired);
                });
            }
            return Ok(());
        }

        if task.desired_status() == TaskStatus::Stopped {
            info!("EngineDispatcher: Ignoring stop for unknown task {}", arn);
            return Ok(());
        }

        info!("EngineDispatcher: Adding task {}", arn);

        if let Err(e) = dependency::validate(&task.containers) {
            error!("EngineDispatcher: Task {} is invalid: {}", arn, e);
            task.set_reason(e.to_string());
            task.set_desired_status(TaskStatus::Stopped);
            self.spawn(task);
            return Err(EngineError::InvalidTask {
                arn,
                reason: e.to_string(),
            });
        }

        if !task.launch_type.is_accounted() {
            self.spawn(task);
            return Ok(());
        }

        if let Err(reason) = ResourceRequirements::for_task(&task)
            .and_then(|req| self.resources.check_fits_host(&req))
        {
            warn!("EngineDispatcher: Task {} can never fit: {}", arn, reason);
            task.set_reason(reason);
            task.set_desired_status(TaskStatus::Stopped);
            self.spawn(task);
            return Ok(());
        }

        // Never overtake tasks that are already waiting.
        if self.queue.is_empty() && self.resources.try_consume(&task) {
            self.spawn(task);
        } else {
            info!(
                "EngineDispatcher: Task {} waiting for resources ({} queued)",
                arn,
                self.queue.len() + 1
            );
            self.queue.enqueue(task);
        }
        Ok(())
    }

    async fn stop_task(&mut self, arn: &str) -> bool {
        if let Some(handle) = self.tasks.get(arn) {
            if handle.inbox.send(TaskMessage::Stop).await.is_err() {
                warn!("EngineDispatcher: Task {} loop is gone", arn);
            }
            return true;
        }
        if self.stop_queued(arn) {
            return true;
        }
        info!("EngineDispatcher: Ignoring stop for unknown task {}", arn);
        false
    }

    /// Pull a task out of the queue and stop it without ever starting it.
    fn stop_queued(&mut self, arn: &str) -> bool {
        let Some(mut task) = self.queue.get(arn) else {
            return false;
        };
        self.queue.remove(arn);
        info!("EngineDispatcher: Stopping queued task {}", arn);
        task.set_desired_status(TaskStatus::Stopped);
        self.spawn(task);
        true
    }

    fn spawn(&mut self, task: Task) {
        let arn = task.arn.clone();
        let handle = ManagedTask::spawn(task, self.ctx.clone(), self.channels.clone());
        self.tasks.insert(arn, handle);
    }

    /// Admit queued tasks from the front for as long as they fit.
    fn admit_waiting(&mut self) {
        while let Some(task) = self.queue.peek_front() {
            if !self.resources.try_consume(&task) {
                break;
            }
            self.queue.dequeue();
            info!("EngineDispatcher: Admitting queued task {}", task.arn);
            self.spawn(task);
        }
    }

    async fn handle_notice(&mut self, notice: TaskNotice) {
        match notice {
            TaskNotice::Changed { .. } => {}
            TaskNotice::Stopped { arn } => {
                info!("EngineDispatcher: Task {} stopped, releasing resources", arn);
                self.resources.release(&arn);
                self.admit_waiting();
            }
            TaskNotice::CleanedUp { arn } => {
                info!("EngineDispatcher: Task {} cleaned up", arn);
                self.tasks.remove(&arn);
                self.resources.release(&arn);
                self.admit_waiting();
            }
        }
        self.persist().await;
    }

    fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .collect();
        tasks.sort_by(|a, b| a.arn.cmp(&b.arn));
        tasks.extend(self.queue.tasks());
        tasks
    }

    fn get_task(&self, arn: &str) -> Option<Task> {
        self.tasks
            .get(arn)
            .map(|h| h.snapshot.borrow().clone())
            .or_else(|| self.queue.get(arn))
    }

    fn snapshot(&self) -> EngineState {
        let tasks = self
            .tasks
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .collect();
        EngineState::new(tasks, self.resources.snapshot(), self.queue.tasks())
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        self.snapshot().save(path).await?;
        Ok(())
    }

    async fn persist(&self) {
        if let Err(e) = self.save().await {
            error!("EngineDispatcher: Failed to save state: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        info!("EngineDispatcher: Stopping {} task loops", self.tasks.len());
        let _ = self.shutdown_tx.send(true);
        let exits = self.tasks.iter_mut().map(|(arn, handle)| async move {
            if tokio::time::timeout(TASK_EXIT_TIMEOUT, &mut handle.join)
                .await
                .is_err()
            {
                warn!("EngineDispatcher: Task {} did not exit in time", arn);
                handle.join.abort();
            }
        });
        join_all(exits).await;
        self.persist().await;
    }
}
