//! Persisted engine state.
//!
//! A single JSON document holding every admitted task, the resource ledger
//! and the waiting queue. Written atomically through a temp file and rename.

use crate::model::Task;
use crate::resources::ResourceRequirements;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid state file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported state format version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub format_version: u32,
    /// Admitted tasks with their containers' known/desired/sent statuses.
    pub tasks: Vec<Task>,
    /// Resource ledger consumption per task ARN.
    pub consumed: BTreeMap<String, ResourceRequirements>,
    /// Queued tasks, front first.
    pub queue: Vec<Task>,
}

impl EngineState {
    pub fn new(
        tasks: Vec<Task>,
        consumed: BTreeMap<String, ResourceRequirements>,
        queue: Vec<Task>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            tasks,
            consumed,
            queue,
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        fs::write(&tmp, json).await.map_err(io_err)?;
        fs::rename(&tmp, path).await.map_err(io_err)?;
        debug!(
            "Saved state: {} tasks, {} queued to {}",
            self.tasks.len(),
            self.queue.len(),
            path.display()
        );
        Ok(())
    }

    /// Load a snapshot. A missing file yields `None`.
    pub async fn load(path: &Path) -> Result<Option<Self>, StateError> {
        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let state: EngineState = serde_json::from_slice(&content)?;
        if state.format_version != FORMAT_VERSION {
            return Err(StateError::UnsupportedVersion(state.format_version));
        }
        Ok(Some(state))
    }
}
