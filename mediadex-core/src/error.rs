use std::path::PathBuf;

use thiserror::Error;

use crate::types::ids::TaskId;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Autoscan location is already watched: {}", .0.display())]
    DuplicateWatch(PathBuf),

    #[error(
        "Autoscan location cannot change from {} to {}",
        current.display(),
        requested.display()
    )]
    InvalidLocationMutation { current: PathBuf, requested: PathBuf },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Task {task_id} failed: {reason}")]
    TaskExecution { task_id: TaskId, reason: String },

    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Service is inactive: {0}")]
    ServiceInactive(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexError {
    /// Whether the error came from a task observing its own invalidation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IndexError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
