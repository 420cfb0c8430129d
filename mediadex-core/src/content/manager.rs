use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cached::CachedStorage;
use super::fs::{FileSystem, is_hidden, list_dir};
use super::storage::{ContentStorage, NewObject, StoredObject};
use super::tasks::{AddFileTask, LoadAccountingTask, RemoveObjectTask, RescanTask, TaskCountGuard};
use crate::autoscan::registry::in_subtree;
use crate::autoscan::{
    AutoscanDirectory, AutoscanRegistry, AutoscanSettings, IntervalTimer, ScanLevel, ScanMode,
    SharedDirectory, Timer, TimerParameter, TimerSubscriber,
};
use crate::cache::StorageCache;
use crate::config::{AutoscanEntryConfig, ImportConfig, IndexerConfig};
use crate::error::{IndexError, Result};
use crate::lifecycle::{ActivationState, ManagedService, ProcessContext};
use crate::scheduler::{TaskContext, TaskInfo, TaskKind, TaskOptions, TaskOwner, TaskPriority, TaskScheduler};
use crate::types::ids::{ObjectId, ScanId, TaskId};

/// Aggregate counters over the indexed content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accounting {
    pub total_files: u64,
}

/// Options for [`ContentManager::add_file`].
#[derive(Clone, Copy, Debug)]
pub struct AddFileOptions {
    pub recursive: bool,
    /// Overrides the configured hidden-files default.
    pub hidden: Option<bool>,
    pub low_priority: bool,
    pub cancellable: bool,
    pub owner: TaskOwner,
    pub parent: Option<TaskId>,
}

impl Default for AddFileOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            hidden: None,
            low_priority: false,
            cancellable: true,
            owner: TaskOwner::User,
            parent: None,
        }
    }
}

/// Collaborators of a [`ContentManager`].
pub struct ContentServices {
    pub storage: Arc<dyn ContentStorage>,
    pub fs: Arc<dyn FileSystem>,
    pub scheduler: Arc<TaskScheduler>,
    pub timer: Arc<dyn Timer>,
}

impl fmt::Debug for ContentServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentServices")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Orchestrates imports, removals and autoscan rescans.
///
/// Owns the timed and inotify autoscan registries, puts a [`StorageCache`] in
/// front of the storage engine and turns requests, timer ticks and
/// filesystem events into scheduler tasks.
pub struct ContentManager {
    self_ref: Weak<ContentManager>,
    import: ImportConfig,
    configured: Vec<AutoscanEntryConfig>,
    storage: Arc<CachedStorage>,
    fs: Arc<dyn FileSystem>,
    scheduler: Arc<TaskScheduler>,
    timer: Arc<dyn Timer>,
    timed: AutoscanRegistry,
    inotify: AutoscanRegistry,
    accounting: Mutex<Accounting>,
    activation: ActivationState,
}

impl fmt::Debug for ContentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentManager")
            .field("timed", &self.timed)
            .field("inotify", &self.inotify)
            .field("cache", self.storage.cache())
            .field("scheduler", &self.scheduler)
            .field("active", &self.activation.is_active())
            .finish()
    }
}

fn is_newer(modified: Option<DateTime<Utc>>, watermark: Option<DateTime<Utc>>) -> bool {
    match (modified, watermark) {
        (Some(modified), Some(watermark)) => modified > watermark,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl ContentManager {
    pub fn new(config: &IndexerConfig, services: ContentServices) -> Result<Arc<Self>> {
        config.validate()?;
        let cache = Arc::new(StorageCache::with_limits(
            config.cache.capacity,
            config.cache.max_fill,
        )?);
        let storage = Arc::new(CachedStorage::new(services.storage, cache));

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            import: config.import,
            configured: config.autoscan.clone(),
            storage,
            fs: services.fs,
            scheduler: services.scheduler,
            timer: services.timer,
            timed: AutoscanRegistry::new(),
            inotify: AutoscanRegistry::new(),
            accounting: Mutex::new(Accounting::default()),
            activation: ActivationState::new("content manager"),
        }))
    }

    /// Build and start the timer, scheduler and content manager, registering
    /// each with `ctx` in dependency order.
    pub async fn launch(
        ctx: &ProcessContext,
        config: &IndexerConfig,
        storage: Arc<dyn ContentStorage>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Arc<Self>> {
        let timer = Arc::new(IntervalTimer::new());
        ctx.register_service(timer.clone());

        let scheduler = TaskScheduler::new("content");
        scheduler.start()?;
        ctx.register_service(scheduler.clone());

        let manager = Self::new(
            config,
            ContentServices {
                storage,
                fs,
                scheduler,
                timer,
            },
        )?;
        manager.init().await?;
        ctx.register_service(manager.clone());
        Ok(manager)
    }

    /// Load persisted autoscan directories, merge the configured ones,
    /// subscribe timed entries and queue an initial rescan of everything.
    /// Safe to call again after a lifecycle restart.
    pub async fn init(&self) -> Result<()> {
        self.activation.ensure_active()?;

        for record in self.storage.load_autoscan_directories().await? {
            if self.get_autoscan_directory_by_location(&record.location).is_some() {
                continue;
            }
            let dir = AutoscanDirectory::from_record(&record).shared();
            if let Err(err) = self.registry(record.mode).add(dir) {
                warn!(location = %record.location.display(), error = %err, "skipping stored autoscan directory");
            }
        }

        for entry in &self.configured {
            let settings = entry.settings(&self.import);
            let dir = match self.get_autoscan_directory_by_location(&entry.location) {
                Some(dir) => {
                    self.apply_settings(&dir, settings)?;
                    dir
                }
                None => {
                    let dir = AutoscanDirectory::new(entry.location.clone(), settings).shared();
                    dir.set_object_id(self.storage.find_object_id_by_path(&entry.location).await?);
                    self.registry(entry.mode).add(Arc::clone(&dir))?;
                    dir
                }
            };
            self.persist(&dir).await?;
        }

        for dir in self.timed.snapshot() {
            self.subscribe(&dir);
        }

        info!(
            timed = self.timed.len(),
            inotify = self.inotify.len(),
            "autoscan directories loaded"
        );

        self.timed.notify_all(self);
        self.inotify.notify_all(self);
        self.load_accounting()?;
        Ok(())
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<StorageCache> {
        self.storage.cache()
    }

    /// Storage as seen by the manager, cache included.
    pub fn storage(&self) -> Arc<dyn ContentStorage> {
        self.storage.clone()
    }

    fn registry(&self, mode: ScanMode) -> &AutoscanRegistry {
        match mode {
            ScanMode::Timed => &self.timed,
            ScanMode::Inotify => &self.inotify,
        }
    }

    fn subscriber(&self) -> Weak<dyn TimerSubscriber> {
        self.self_ref.clone()
    }

    fn subscribe(&self, dir: &AutoscanDirectory) {
        if dir.mode() == ScanMode::Timed && dir.scan_id().is_some() {
            self.timer
                .add_subscriber(self.subscriber(), dir.interval(), dir.timer_parameter());
        }
    }

    async fn persist(&self, dir: &AutoscanDirectory) -> Result<()> {
        match dir.record() {
            Some(record) => self.storage.update_autoscan(&record).await,
            None => Ok(()),
        }
    }

    // Tasks and scheduler facade

    pub fn current_task(&self) -> Option<TaskInfo> {
        self.scheduler.current_task()
    }

    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        self.scheduler.list_tasks()
    }

    pub fn invalidate_task(&self, task_id: TaskId, owner: TaskOwner) -> bool {
        self.scheduler.invalidate(task_id, owner)
    }

    pub fn is_busy(&self) -> bool {
        self.scheduler.is_busy()
    }

    pub fn accounting(&self) -> Accounting {
        *self.accounting.lock()
    }

    pub fn load_accounting(&self) -> Result<TaskId> {
        self.activation.ensure_active()?;
        self.scheduler.enqueue(
            LoadAccountingTask {
                manager: self.self_ref.clone(),
            },
            TaskPriority::Low,
        )
    }

    pub async fn load_accounting_now(&self) -> Result<Accounting> {
        let total_files = self.storage.total_files().await?;
        let mut accounting = self.accounting.lock();
        accounting.total_files = total_files;
        debug!(total_files, "accounting loaded");
        Ok(*accounting)
    }

    // Imports

    /// Queue an import of `path`.
    pub fn add_file(&self, path: impl Into<PathBuf>, options: AddFileOptions) -> Result<TaskId> {
        self.activation.ensure_active()?;
        let path = path.into();
        let priority = if options.low_priority {
            TaskPriority::Low
        } else {
            TaskPriority::Normal
        };
        self.scheduler.enqueue_with(
            Box::new(AddFileTask {
                manager: self.self_ref.clone(),
                path,
                recursive: options.recursive,
                hidden: options.hidden.unwrap_or(self.import.hidden_files),
            }),
            TaskOptions::default()
                .with_priority(priority)
                .with_owner(options.owner)
                .cancellable(options.cancellable)
                .with_parent(options.parent),
        )
    }

    /// Import `path` right away and return the id of its object. Hidden paths
    /// that are not wanted yield `None`.
    pub async fn add_file_now(
        &self,
        path: &Path,
        recursive: bool,
        hidden: Option<bool>,
    ) -> Result<Option<ObjectId>> {
        self.activation.ensure_active()?;
        self.import_path(None, path, recursive, hidden.unwrap_or(self.import.hidden_files))
            .await
    }

    /// Make sure containers exist for `path` and its ancestors.
    pub async fn ensure_path_existence(&self, path: &Path) -> Result<ObjectId> {
        let id = self.storage.ensure_path_existence(path).await?;
        self.attach_autoscan(path, id);
        Ok(id)
    }

    pub(crate) async fn import_path(
        &self,
        ctx: Option<&TaskContext>,
        path: &Path,
        recursive: bool,
        hidden: bool,
    ) -> Result<Option<ObjectId>> {
        if !hidden && is_hidden(path) {
            debug!(path = %path.display(), "skipping hidden path");
            return Ok(None);
        }
        if !self.fs.path_exists(path).await {
            return Err(IndexError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }

        let md = self.fs.metadata(path).await?;
        if md.is_file {
            if let Some(id) = self.storage.find_object_id_by_path(path).await? {
                return Ok(Some(id));
            }
            let parent = match path.parent() {
                Some(parent) if parent.parent().is_some() => {
                    self.ensure_path_existence(parent).await?
                }
                _ => ObjectId::ROOT,
            };
            return Ok(Some(self.import_file(parent, path, md.modified).await?.id));
        }
        if !md.is_dir {
            debug!(path = %path.display(), "skipping special file");
            return Ok(None);
        }

        let root = self.ensure_path_existence(path).await?;
        if !recursive {
            return Ok(Some(root));
        }

        let mut pending = vec![(path.to_path_buf(), root)];
        while let Some((dir_path, dir_id)) = pending.pop() {
            for entry in list_dir(self.fs.as_ref(), &dir_path).await? {
                if let Some(ctx) = ctx {
                    ctx.checkpoint()?;
                }
                if !hidden && is_hidden(&entry) {
                    continue;
                }
                let md = match self.fs.metadata(&entry).await {
                    Ok(md) => md,
                    Err(err) => {
                        debug!(path = %entry.display(), error = %err, "entry vanished during import");
                        continue;
                    }
                };
                if md.is_dir {
                    let id = self.ensure_path_existence(&entry).await?;
                    pending.push((entry, id));
                } else if md.is_file
                    && self.storage.find_object_id_by_path(&entry).await?.is_none()
                {
                    self.import_file(dir_id, &entry, md.modified).await?;
                }
            }
        }
        Ok(Some(root))
    }

    async fn import_file(
        &self,
        parent_id: ObjectId,
        path: &Path,
        modified: Option<DateTime<Utc>>,
    ) -> Result<StoredObject> {
        let stored = self
            .storage
            .add_object(NewObject {
                parent_id,
                location: path.to_path_buf(),
                is_container: false,
                modified,
            })
            .await?;
        self.accounting.lock().total_files += 1;
        debug!(path = %path.display(), object_id = %stored.id, "file imported");
        Ok(stored)
    }

    /// Give autoscan directories at `path` that lost their object the new one.
    fn attach_autoscan(&self, path: &Path, id: ObjectId) {
        for registry in [&self.timed, &self.inotify] {
            if let Some(dir) = registry.get_by_location(path)
                && dir.object_id().is_none()
            {
                dir.set_object_id(Some(id));
            }
        }
    }

    // Removal

    /// Queue removal of `object_id`.
    pub fn remove_object(&self, object_id: ObjectId, all: bool, owner: TaskOwner) -> Result<TaskId> {
        self.activation.ensure_active()?;
        self.scheduler.enqueue_with(
            Box::new(RemoveObjectTask {
                manager: self.self_ref.clone(),
                object_id,
                all,
            }),
            TaskOptions::default().with_owner(owner),
        )
    }

    /// Remove `object_id` right away. Autoscan directories below a removed
    /// container are dropped, persistent ones only lose their object, and
    /// pending imports below it are invalidated.
    pub async fn remove_object_now(&self, object_id: ObjectId, all: bool) -> Result<()> {
        if object_id == ObjectId::ROOT {
            return Err(IndexError::InvalidOperation(
                "the root container cannot be removed".into(),
            ));
        }
        let Some(object) = self.storage.get_object(object_id).await? else {
            debug!(object_id = %object_id, "object already gone");
            return Ok(());
        };

        if object.is_container {
            // Refuse before cascading so a rejected removal changes nothing.
            if !all && self.storage.count_children(object_id).await? > 0 {
                return Err(IndexError::InvalidOperation(format!(
                    "object {object_id} still has children"
                )));
            }
            self.drop_autoscans_below(&object.location).await?;
        }

        let location = object.location.clone();
        let is_pending_import = |info: &TaskInfo| {
            info.kind == TaskKind::AddFile
                && info
                    .subject
                    .as_deref()
                    .is_some_and(|subject| subject.starts_with(&location))
        };
        let invalidated = self
            .scheduler
            .invalidate_where(TaskOwner::Internal, is_pending_import)
            + self.scheduler.invalidate_where(TaskOwner::User, is_pending_import);
        if invalidated > 0 {
            debug!(location = %location.display(), invalidated, "pending imports invalidated");
        }

        let removed = self.storage.remove_object(object_id, all).await?;
        let files = removed.iter().filter(|object| !object.is_container).count() as u64;
        {
            let mut accounting = self.accounting.lock();
            accounting.total_files = accounting.total_files.saturating_sub(files);
        }
        info!(
            object_id = %object_id,
            location = %location.display(),
            removed = removed.len(),
            "object removed"
        );
        Ok(())
    }

    async fn drop_autoscans_below(&self, location: &Path) -> Result<()> {
        for mode in [ScanMode::Timed, ScanMode::Inotify] {
            let registry = self.registry(mode);

            let below = registry.snapshot();
            for dir in below.iter().filter(|dir| dir.persistent() && in_subtree(dir, location, true)) {
                self.handle_persistent_autoscan_remove(dir).await?;
            }

            let parameters: Vec<TimerParameter> = below
                .iter()
                .filter(|dir| in_subtree(dir, location, false))
                .map(|dir| dir.timer_parameter())
                .collect();
            let removed = registry.remove_subtree(location, false);
            if mode == ScanMode::Timed {
                for parameter in parameters {
                    self.timer.remove_subscriber(parameter);
                }
            }
            for dir in removed.snapshot() {
                if let Some(location) = dir.location() {
                    self.storage.remove_autoscan(location).await?;
                }
            }
        }
        Ok(())
    }

    // Rescans

    /// Queue a rescan of the autoscan directory `scan_id`.
    pub fn rescan_directory(
        &self,
        mode: ScanMode,
        scan_id: ScanId,
        owner: TaskOwner,
        cancellable: bool,
    ) -> Result<TaskId> {
        self.activation.ensure_active()?;
        let dir = self.registry(mode).get(scan_id).ok_or_else(|| {
            IndexError::InvalidOperation(format!("no {mode} autoscan directory with scan id {scan_id}"))
        })?;
        self.enqueue_rescan(
            dir,
            None,
            None,
            TaskOptions::default()
                .with_owner(owner)
                .cancellable(cancellable),
        )
    }

    fn enqueue_rescan(
        &self,
        dir: SharedDirectory,
        container: Option<ObjectId>,
        path: Option<PathBuf>,
        options: TaskOptions,
    ) -> Result<TaskId> {
        let path = match path.or_else(|| dir.location().map(Path::to_path_buf)) {
            Some(path) => path,
            None => {
                return Err(IndexError::InvalidOperation(
                    "autoscan directory has no location".into(),
                ));
            }
        };
        let task = RescanTask {
            manager: self.self_ref.clone(),
            dir: Arc::clone(&dir),
            container,
            path,
            _in_flight: TaskCountGuard::new(dir),
        };
        self.scheduler.enqueue_with(Box::new(task), options)
    }

    /// Object of the autoscan root, recreating it when the directory exists
    /// on disk but has no object. `None` when the directory is gone.
    async fn resolve_root(&self, dir: &SharedDirectory) -> Result<Option<ObjectId>> {
        let Some(location) = dir.location() else {
            return Ok(None);
        };

        if self.fs.path_exists(location).await {
            if let Some(id) = dir.object_id()
                && self.storage.get_object(id).await?.is_some()
            {
                return Ok(Some(id));
            }
            return self.recreate_autoscan_root(dir).await;
        }

        if let Some(id) = dir.object_id() {
            self.remove_object_now(id, true).await?;
        }
        if dir.persistent() {
            self.handle_persistent_autoscan_remove(dir).await?;
        } else if let Some(scan_id) = dir.scan_id() {
            info!(location = %location.display(), "autoscan directory vanished, dropping it");
            self.remove_autoscan_entry(dir.mode(), scan_id).await?;
        }
        Ok(None)
    }

    pub(crate) async fn rescan(
        &self,
        ctx: &TaskContext,
        dir: &SharedDirectory,
        container: Option<ObjectId>,
        path: &Path,
    ) -> Result<()> {
        ctx.checkpoint()?;
        if dir.scan_id().is_none() {
            debug!(path = %path.display(), "autoscan directory no longer registered");
            return Ok(());
        }

        let container = match container {
            Some(id) => {
                if !self.fs.path_exists(path).await
                    || self.storage.get_object(id).await?.is_none()
                {
                    debug!(path = %path.display(), "sub-directory vanished");
                    return self.remove_object_now(id, true).await;
                }
                id
            }
            None => match self.resolve_root(dir).await? {
                Some(id) => id,
                None => return Ok(()),
            },
        };

        let hidden = dir.hidden();
        let recursive = dir.recursive();
        let full = dir.level() == ScanLevel::Full;
        let previous = dir.previous_lmt();

        let mut stored: HashMap<PathBuf, StoredObject> = self
            .storage
            .list_children(container)
            .await?
            .into_iter()
            .map(|object| (object.location.clone(), object))
            .collect();

        for entry in list_dir(self.fs.as_ref(), path).await? {
            ctx.checkpoint()?;
            if !hidden && is_hidden(&entry) {
                continue;
            }
            let md = match self.fs.metadata(&entry).await {
                Ok(md) => md,
                Err(err) => {
                    debug!(path = %entry.display(), error = %err, "entry vanished during scan");
                    continue;
                }
            };
            if let Some(modified) = md.modified {
                dir.set_current_lmt(modified);
            }

            let known = stored.remove(&entry);
            if md.is_file {
                match known {
                    None => {
                        self.import_file(container, &entry, md.modified).await?;
                    }
                    Some(mut object) if full && is_newer(md.modified, previous) => {
                        object.modified = md.modified;
                        self.storage.update_object(&object).await?;
                        debug!(path = %entry.display(), "modified file re-imported");
                    }
                    Some(_) => {}
                }
            } else if md.is_dir && recursive {
                let options = TaskOptions::default()
                    .with_priority(ctx.priority())
                    .with_owner(TaskOwner::Internal)
                    .cancellable(ctx.cancellable())
                    .with_parent(Some(ctx.task_id()));
                match known {
                    Some(object) => {
                        self.enqueue_rescan(Arc::clone(dir), Some(object.id), Some(entry), options)?;
                    }
                    None => {
                        self.add_file(
                            entry,
                            AddFileOptions {
                                recursive: true,
                                hidden: Some(hidden),
                                low_priority: options.priority == TaskPriority::Low,
                                cancellable: options.cancellable,
                                owner: TaskOwner::Internal,
                                parent: Some(ctx.task_id()),
                            },
                        )?;
                    }
                }
            }
        }

        for object in stored.into_values() {
            ctx.checkpoint()?;
            debug!(path = %object.location.display(), "removing vanished entry");
            self.remove_object_now(object.id, true).await?;
        }
        Ok(())
    }

    /// Close a scan: promote the watermark and persist it.
    pub(crate) async fn finish_scan(&self, dir: &AutoscanDirectory) -> Result<()> {
        dir.update_lmt();
        if dir.scan_id().is_some() {
            self.persist(dir).await?;
        }
        debug!(location = ?dir.location(), watermark = ?dir.previous_lmt(), "scan finished");
        Ok(())
    }

    // Autoscan administration

    /// Add an autoscan directory at `location`, or update the settings of the
    /// existing one. A changed mode moves it to the other registry. A rescan
    /// is queued either way.
    pub async fn set_autoscan_directory(
        &self,
        location: impl Into<PathBuf>,
        settings: AutoscanSettings,
    ) -> Result<SharedDirectory> {
        self.activation.ensure_active()?;
        let location = location.into();
        if settings.mode == ScanMode::Timed && settings.interval.is_zero() {
            return Err(IndexError::InvalidConfig(format!(
                "timed autoscan {} needs a non-zero interval",
                location.display()
            )));
        }

        let dir = match self.get_autoscan_directory_by_location(&location) {
            Some(dir) => {
                self.apply_settings(&dir, settings)?;
                dir
            }
            None => {
                let dir = AutoscanDirectory::new(location.clone(), settings).shared();
                dir.set_object_id(self.storage.find_object_id_by_path(&location).await?);
                self.registry(dir.mode()).add(Arc::clone(&dir))?;
                info!(location = %location.display(), mode = %dir.mode(), "autoscan directory added");
                dir
            }
        };

        self.subscribe(&dir);
        self.persist(&dir).await?;
        self.enqueue_rescan(
            Arc::clone(&dir),
            None,
            None,
            TaskOptions::default().with_owner(TaskOwner::User),
        )?;
        Ok(dir)
    }

    fn apply_settings(&self, dir: &SharedDirectory, settings: AutoscanSettings) -> Result<()> {
        let old_mode = dir.mode();
        let old_parameter = dir.timer_parameter();
        if old_mode == ScanMode::Timed {
            self.timer.remove_subscriber(old_parameter);
        }

        let new_mode = settings.mode;
        dir.update_settings(settings);
        if old_mode != new_mode {
            if let Some(scan_id) = old_parameter.scan_id {
                self.registry(old_mode).remove(scan_id);
            }
            self.registry(new_mode).add(Arc::clone(dir))?;
            info!(location = ?dir.location(), from = %old_mode, to = %new_mode, "autoscan mode changed");
        }
        Ok(())
    }

    pub fn get_autoscan_directory(&self, mode: ScanMode, scan_id: ScanId) -> Option<SharedDirectory> {
        self.registry(mode).get(scan_id)
    }

    pub fn get_autoscan_directory_by_location(&self, location: &Path) -> Option<SharedDirectory> {
        self.timed
            .get_by_location(location)
            .or_else(|| self.inotify.get_by_location(location))
    }

    pub fn get_autoscan_directory_by_object_id(&self, object_id: ObjectId) -> Option<SharedDirectory> {
        self.timed
            .get_by_object_id(object_id)
            .or_else(|| self.inotify.get_by_object_id(object_id))
    }

    pub fn autoscan_directories(&self, mode: ScanMode) -> Vec<SharedDirectory> {
        self.registry(mode).snapshot()
    }

    pub fn all_autoscan_directories(&self) -> Vec<SharedDirectory> {
        let mut all = self.timed.snapshot();
        all.extend(self.inotify.snapshot());
        all
    }

    async fn remove_autoscan_entry(&self, mode: ScanMode, scan_id: ScanId) -> Result<Option<SharedDirectory>> {
        let registry = self.registry(mode);
        let Some(dir) = registry.get(scan_id) else {
            return Ok(None);
        };
        let parameter = dir.timer_parameter();
        registry.remove(scan_id);
        if mode == ScanMode::Timed {
            self.timer.remove_subscriber(parameter);
        }
        if let Some(location) = dir.location() {
            self.storage.remove_autoscan(location).await?;
            info!(location = %location.display(), "autoscan directory removed");
        }
        Ok(Some(dir))
    }

    pub async fn remove_autoscan_directory(
        &self,
        mode: ScanMode,
        scan_id: ScanId,
    ) -> Result<Option<SharedDirectory>> {
        self.remove_autoscan_entry(mode, scan_id).await
    }

    pub async fn remove_autoscan_directory_by_location(
        &self,
        location: &Path,
    ) -> Result<Option<SharedDirectory>> {
        let Some(dir) = self.get_autoscan_directory_by_location(location) else {
            debug!(location = %location.display(), "no autoscan directory to remove");
            return Ok(None);
        };
        match dir.scan_id() {
            Some(scan_id) => self.remove_autoscan_entry(dir.mode(), scan_id).await,
            None => Ok(None),
        }
    }

    pub async fn remove_autoscan_directory_by_object_id(
        &self,
        object_id: ObjectId,
    ) -> Result<Option<SharedDirectory>> {
        let Some(dir) = self.get_autoscan_directory_by_object_id(object_id) else {
            debug!(object_id = %object_id, "no autoscan directory to remove");
            return Ok(None);
        };
        match dir.scan_id() {
            Some(scan_id) => self.remove_autoscan_entry(dir.mode(), scan_id).await,
            None => Ok(None),
        }
    }

    /// A persistent directory vanished: forget its object but keep watching.
    pub async fn handle_persistent_autoscan_remove(&self, dir: &AutoscanDirectory) -> Result<()> {
        if dir.object_id().is_none() {
            return Ok(());
        }
        dir.set_object_id(None);
        self.persist(dir).await?;
        info!(location = ?dir.location(), "persistent autoscan directory vanished, waiting for it to return");
        Ok(())
    }

    /// A vanished persistent directory is back: recreate its object chain.
    pub async fn handle_persistent_autoscan_recreate(&self, dir: &AutoscanDirectory) -> Result<Option<ObjectId>> {
        self.recreate_autoscan_root(dir).await
    }

    async fn recreate_autoscan_root(&self, dir: &AutoscanDirectory) -> Result<Option<ObjectId>> {
        let Some(location) = dir.location() else {
            return Ok(None);
        };
        if !self.fs.path_exists(location).await {
            return Ok(None);
        }
        let id = self.storage.ensure_path_existence(location).await?;
        dir.set_object_id(Some(id));
        self.persist(dir).await?;
        debug!(location = %location.display(), object_id = %id, "autoscan root object created");
        Ok(Some(id))
    }

    /// Map a filesystem change below an inotify watch to work: unknown paths
    /// are imported, anything else rescans the watch.
    pub async fn handle_fs_event(&self, path: &Path) -> Result<Option<TaskId>> {
        self.activation.ensure_active()?;
        let watch = self
            .inotify
            .snapshot()
            .into_iter()
            .filter(|dir| dir.location().is_some_and(|location| path.starts_with(location)))
            .max_by_key(|dir| dir.location().map_or(0, |location| location.components().count()));
        let Some(dir) = watch else {
            debug!(path = %path.display(), "event outside of inotify autoscans");
            return Ok(None);
        };

        let is_root = dir.location() == Some(path);
        if !is_root
            && dir.object_id().is_some()
            && self.fs.path_exists(path).await
            && self.storage.find_object_id_by_path(path).await?.is_none()
        {
            let task_id = self.add_file(
                path,
                AddFileOptions {
                    recursive: dir.recursive(),
                    hidden: Some(dir.hidden()),
                    owner: TaskOwner::Internal,
                    ..AddFileOptions::default()
                },
            )?;
            return Ok(Some(task_id));
        }

        let task_id = self.enqueue_rescan(dir, None, None, TaskOptions::default())?;
        Ok(Some(task_id))
    }

    /// Persist the watermark of every registered autoscan directory. Returns
    /// how many were written; failures are logged and skipped.
    pub async fn update_lm_in_db(&self) -> usize {
        let mut written = 0;
        for dir in self.all_autoscan_directories() {
            match self.persist(&dir).await {
                Ok(()) => written += 1,
                Err(err) => {
                    warn!(location = ?dir.location(), error = %err, "failed to persist autoscan watermark");
                }
            }
        }
        written
    }
}

impl TimerSubscriber for ContentManager {
    fn timer_notify(&self, parameter: TimerParameter) {
        if !self.activation.is_active() {
            return;
        }
        let Some(scan_id) = parameter.scan_id else {
            return;
        };
        let Some(dir) = self.registry(parameter.mode).get(scan_id) else {
            debug!(?parameter, "timer fired for unknown autoscan directory");
            return;
        };
        if dir.task_count() > 0 {
            debug!(location = ?dir.location(), "rescan already in flight");
            return;
        }

        let options = TaskOptions::default().with_priority(TaskPriority::Low);
        if let Err(err) = self.enqueue_rescan(dir, None, None, options) {
            warn!(?parameter, error = %err, "failed to queue rescan");
        }
    }
}

#[async_trait]
impl ManagedService for ContentManager {
    fn name(&self) -> &'static str {
        "content manager"
    }

    async fn shutdown(&self) {
        for dir in self.timed.snapshot() {
            self.timer.remove_subscriber(dir.timer_parameter());
        }
        let written = self.update_lm_in_db().await;
        info!(written, "content manager shut down");
    }

    fn inactivate(&self) {
        self.activation.inactivate();
    }

    fn reactivate(&self) {
        self.activation.reactivate();
    }
}
