//! hostagent - task and container lifecycle agent.
//!
//! Runs on a compute host and drives the tasks a remote control plane
//! assigns to it: pulls images, creates and starts containers in
//! dependency order, watches them, stops them and cleans up, while
//! reporting every observable state change exactly once.
//!
//! ## Architecture
//!
//! - **Engine**: admission against the host resource ledger, FIFO waiting
//!   queue, task registry and state checkpoints
//! - **Managed tasks**: one loop per admitted task that reconciles container
//!   known status toward desired status
//! - **Runtime driver**: primitive container operations behind a trait, with
//!   an in-memory implementation for local runs and tests
//!
//! ## Usage
//!
//! ```no_run
//! use hostagent::{Config, Engine, MockRuntime, NoopProvisioner};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (engine, mut events) = Engine::start(
//!     Config::default(),
//!     Arc::new(MockRuntime::new()),
//!     Arc::new(NoopProvisioner::new()),
//! )
//! .await?;
//! while let Some(change) = events.recv().await {
//!     println!("{} {} {}", change.resource_type(), change.resource_id(), change.status());
//! }
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod provisioner;
pub mod queue;
pub mod resources;
pub mod runtime;
pub mod state;
pub mod status;

pub use config::{Config, HostResources};
pub use engine::{Engine, StateChangeEvents};
pub use error::{EngineError, Result};
pub use event::StateChange;
pub use model::{Container, Task};
pub use runtime::{MockRuntime, NoopProvisioner, RuntimeDriver};
pub use status::{ContainerStatus, TaskStatus};
