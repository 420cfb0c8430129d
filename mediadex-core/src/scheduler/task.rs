use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{IndexError, Result};
use crate::types::ids::TaskId;

/// Which side of the system asked for the work.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskOwner {
    /// Work the indexer schedules for itself (timers, watch events, sub-tasks).
    Internal,
    /// Work requested through the administrative interface.
    User,
}

/// The two dequeue lanes. Normal work always drains before low priority work.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    Normal,
    Low,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    AddFile,
    RemoveObject,
    RescanDirectory,
    LoadAccounting,
    Other,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::AddFile => write!(f, "add"),
            TaskKind::RemoveObject => write!(f, "remove"),
            TaskKind::RescanDirectory => write!(f, "rescan"),
            TaskKind::LoadAccounting => write!(f, "accounting"),
            TaskKind::Other => write!(f, "other"),
        }
    }
}

/// A unit of background work executed by the scheduler's worker.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn kind(&self) -> TaskKind;

    /// Human readable summary shown in task listings.
    fn description(&self) -> String;

    /// Filesystem path the task operates on, if any.
    fn subject(&self) -> Option<&Path> {
        None
    }

    /// Run the task. Long running bodies should call
    /// [`TaskContext::checkpoint`] between units of work.
    async fn run(&self, ctx: &TaskContext) -> Result<()>;
}

/// Enqueue options beyond the priority lane.
#[derive(Clone, Copy, Debug)]
pub struct TaskOptions {
    pub priority: TaskPriority,
    pub owner: TaskOwner,
    pub cancellable: bool,
    pub parent: Option<TaskId>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            owner: TaskOwner::Internal,
            cancellable: true,
            parent: None,
        }
    }
}

impl TaskOptions {
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner: TaskOwner) -> Self {
        self.owner = owner;
        self
    }

    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    pub fn with_parent(mut self, parent: Option<TaskId>) -> Self {
        self.parent = parent;
        self
    }
}

/// Scheduler-side bookkeeping for a queued or running task.
#[derive(Debug)]
pub(crate) struct TaskMeta {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) description: String,
    pub(crate) subject: Option<PathBuf>,
    pub(crate) options: TaskOptions,
    pub(crate) token: CancellationToken,
}

impl TaskMeta {
    pub(crate) fn is_valid(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            parent: self.options.parent,
            kind: self.kind,
            owner: self.options.owner,
            priority: self.options.priority,
            cancellable: self.options.cancellable,
            valid: self.is_valid(),
            description: self.description.clone(),
            subject: self.subject.clone(),
        }
    }
}

/// Read-only snapshot of a task for status queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub kind: TaskKind,
    pub owner: TaskOwner,
    pub priority: TaskPriority,
    pub cancellable: bool,
    pub valid: bool,
    pub description: String,
    pub subject: Option<PathBuf>,
}

/// Handle passed to [`Task::run`] for cooperative cancellation.
#[derive(Clone, Debug)]
pub struct TaskContext {
    meta: Arc<TaskMeta>,
}

impl TaskContext {
    pub(crate) fn new(meta: Arc<TaskMeta>) -> Self {
        Self { meta }
    }

    pub fn task_id(&self) -> TaskId {
        self.meta.id
    }

    pub fn priority(&self) -> TaskPriority {
        self.meta.options.priority
    }

    pub fn cancellable(&self) -> bool {
        self.meta.options.cancellable
    }

    pub fn is_valid(&self) -> bool {
        self.meta.is_valid()
    }

    /// Returns [`IndexError::Cancelled`] once the task has been invalidated.
    pub fn checkpoint(&self) -> Result<()> {
        if self.meta.is_valid() {
            Ok(())
        } else {
            Err(IndexError::Cancelled(format!(
                "task {} ({}) was invalidated",
                self.meta.id, self.meta.description
            )))
        }
    }

    /// Resolves when the task is invalidated.
    pub async fn invalidated(&self) {
        self.meta.token.cancelled().await
    }
}
