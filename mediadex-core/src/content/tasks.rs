use std::path::{Path, PathBuf};
use std::sync::Weak;

use async_trait::async_trait;

use super::manager::ContentManager;
use crate::autoscan::SharedDirectory;
use crate::error::{IndexError, Result};
use crate::scheduler::{Task, TaskContext, TaskKind};
use crate::types::ids::ObjectId;

fn upgrade(manager: &Weak<ContentManager>) -> Result<std::sync::Arc<ContentManager>> {
    manager
        .upgrade()
        .ok_or(IndexError::ServiceInactive("content manager"))
}

/// Counts a rescan as in flight for as long as the task exists, whether it
/// runs or is dropped unexecuted after invalidation.
pub(crate) struct TaskCountGuard {
    dir: SharedDirectory,
}

impl TaskCountGuard {
    pub(crate) fn new(dir: SharedDirectory) -> Self {
        dir.increment_task_count();
        Self { dir }
    }
}

impl Drop for TaskCountGuard {
    fn drop(&mut self) {
        self.dir.decrement_task_count();
    }
}

pub(crate) struct AddFileTask {
    pub(crate) manager: Weak<ContentManager>,
    pub(crate) path: PathBuf,
    pub(crate) recursive: bool,
    pub(crate) hidden: bool,
}

#[async_trait]
impl Task for AddFileTask {
    fn kind(&self) -> TaskKind {
        TaskKind::AddFile
    }

    fn description(&self) -> String {
        format!("Importing {}", self.path.display())
    }

    fn subject(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        let manager = upgrade(&self.manager)?;
        manager
            .import_path(Some(ctx), &self.path, self.recursive, self.hidden)
            .await?;
        Ok(())
    }
}

pub(crate) struct RemoveObjectTask {
    pub(crate) manager: Weak<ContentManager>,
    pub(crate) object_id: ObjectId,
    pub(crate) all: bool,
}

#[async_trait]
impl Task for RemoveObjectTask {
    fn kind(&self) -> TaskKind {
        TaskKind::RemoveObject
    }

    fn description(&self) -> String {
        format!("Removing object {}", self.object_id)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        ctx.checkpoint()?;
        upgrade(&self.manager)?
            .remove_object_now(self.object_id, self.all)
            .await
    }
}

pub(crate) struct RescanTask {
    pub(crate) manager: Weak<ContentManager>,
    pub(crate) dir: SharedDirectory,
    /// `None` for the autoscan root, resolved when the task runs.
    pub(crate) container: Option<ObjectId>,
    pub(crate) path: PathBuf,
    pub(crate) _in_flight: TaskCountGuard,
}

#[async_trait]
impl Task for RescanTask {
    fn kind(&self) -> TaskKind {
        TaskKind::RescanDirectory
    }

    fn description(&self) -> String {
        format!("Scanning {}", self.path.display())
    }

    fn subject(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        let manager = upgrade(&self.manager)?;
        manager
            .rescan(ctx, &self.dir, self.container, &self.path)
            .await?;

        // The last rescan of a directory to finish closes the scan.
        if self.dir.task_count() == 1 {
            manager.finish_scan(&self.dir).await?;
        }
        Ok(())
    }
}

pub(crate) struct LoadAccountingTask {
    pub(crate) manager: Weak<ContentManager>,
}

#[async_trait]
impl Task for LoadAccountingTask {
    fn kind(&self) -> TaskKind {
        TaskKind::LoadAccounting
    }

    fn description(&self) -> String {
        "Initializing statistics".to_string()
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<()> {
        upgrade(&self.manager)?.load_accounting_now().await?;
        Ok(())
    }
}
