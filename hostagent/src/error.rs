//! Engine error types.

use thiserror::Error;

pub use crate::dependency::DependencyError;
pub use crate::event::EventError;
pub use crate::provisioner::ProvisionError;
pub use crate::runtime::RuntimeError;
pub use crate::state::StateError;

/// Errors returned by the engine handle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid task {arn}: {reason}")]
    InvalidTask { arn: String, reason: String },

    /// The engine loop is gone (shut down or crashed).
    #[error("engine is not running")]
    NotRunning,

    #[error(transparent)]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
