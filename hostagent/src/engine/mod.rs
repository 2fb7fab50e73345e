//! Task engine.
//!
//! The engine admits tasks against the host resource ledger, keeps the ones
//! that do not fit in a FIFO waiting queue and drives every admitted task
//! through its own loop. All registry mutation happens on the dispatcher
//! task; [`Engine`] is a cheap handle that talks to it over a channel.

pub mod dispatcher;
mod managed_task;
pub mod transition;

pub use dispatcher::EngineDispatcher;
pub use managed_task::{ESSENTIAL_EXIT_REASON, aggregate_status, propagate_desired};
pub use transition::{StepContext, TransitionError, TransitionResult};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::event::StateChange;
use crate::model::Task;
use crate::provisioner::TaskProvisioner;
use crate::queue::WaitingQueue;
use crate::resources::HostResourceManager;
use crate::runtime::RuntimeDriver;
use crate::state::EngineState;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Stream of state changes to report upstream, in emission order.
pub type StateChangeEvents = mpsc::Receiver<StateChange>;

/// Commands handled by the [`EngineDispatcher`].
#[derive(Debug)]
pub enum Command {
    AddTask {
        task: Box<Task>,
        responder: oneshot::Sender<Result<()>>,
    },
    StopTask {
        arn: String,
        responder: oneshot::Sender<bool>,
    },
    ListTasks {
        responder: oneshot::Sender<Vec<Task>>,
    },
    GetTask {
        arn: String,
        responder: oneshot::Sender<Option<Task>>,
    },
    SaveState {
        responder: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    command_tx: mpsc::Sender<Command>,
    resources: Arc<HostResourceManager>,
    queue: Arc<WaitingQueue>,
}

impl Engine {
    /// Start the engine, restoring saved state when a state file is
    /// configured and present.
    pub async fn start(
        config: Config,
        runtime: Arc<dyn RuntimeDriver>,
        provisioner: Arc<dyn TaskProvisioner>,
    ) -> Result<(Engine, StateChangeEvents)> {
        let saved = match &config.state_file {
            Some(path) => EngineState::load(path).await?,
            None => None,
        };

        let resources = Arc::new(HostResourceManager::new(config.host.clone()));
        let queue = Arc::new(WaitingQueue::new());
        let (command_tx, command_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);

        let ctx = StepContext {
            runtime,
            provisioner,
            config: Arc::new(config),
        };
        let mut dispatcher = EngineDispatcher::new(
            command_rx,
            events_tx,
            ctx,
            Arc::clone(&resources),
            Arc::clone(&queue),
        );
        if let Some(state) = saved {
            dispatcher.restore(state);
        }
        tokio::spawn(dispatcher.run());

        info!("Engine started (version {})", Self::version());
        Ok((
            Engine {
                command_tx,
                resources,
                queue,
            },
            events_rx,
        ))
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Add a task, or update the desired status of a known one.
    ///
    /// A task with an invalid container dependency graph is still tracked
    /// (it goes straight to STOPPED) but the error is returned here as well.
    pub async fn add_task(&self, task: Task) -> Result<()> {
        self.request(|responder| Command::AddTask {
            task: Box::new(task),
            responder,
        })
        .await?
    }

    /// Request a stop. Returns false when the task is unknown.
    pub async fn stop_task(&self, arn: &str) -> Result<bool> {
        self.request(|responder| Command::StopTask {
            arn: arn.to_string(),
            responder,
        })
        .await
    }

    /// Every tracked task: admitted ones by ARN, then the queue in order.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.request(|responder| Command::ListTasks { responder })
            .await
    }

    pub async fn get_task_by_arn(&self, arn: &str) -> Result<Task> {
        self.request(|responder| Command::GetTask {
            arn: arn.to_string(),
            responder,
        })
        .await?
        .ok_or_else(|| EngineError::TaskNotFound(arn.to_string()))
    }

    /// The task at the head of the waiting queue.
    pub fn top_queued_task(&self) -> Option<Task> {
        self.queue.peek_front()
    }

    pub fn queued_tasks(&self) -> Vec<Task> {
        self.queue.tasks()
    }

    /// Whether `arn` currently holds host resources.
    pub fn is_consuming(&self, arn: &str) -> bool {
        self.resources.is_consuming(arn)
    }

    /// Host cpu units and memory currently in use.
    pub fn used_resources(&self) -> (u64, u64) {
        self.resources.used()
    }

    pub async fn save_state(&self) -> Result<()> {
        self.request(|responder| Command::SaveState { responder })
            .await?
    }

    /// Stop the task loops (containers are left as they are) and write a
    /// final snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|responder| Command::Shutdown { responder })
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)
    }
}
