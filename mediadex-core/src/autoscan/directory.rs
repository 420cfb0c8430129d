use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::timer::TimerParameter;
use crate::error::{IndexError, Result};
use crate::types::ids::{ObjectId, ScanId};

/// How changes below a watched directory are noticed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Periodic rescans driven by the timer service.
    Timed,
    /// Rescans driven by filesystem change notifications.
    Inotify,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Timed => "timed",
            ScanMode::Inotify => "inotify",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timed" => Ok(ScanMode::Timed),
            "inotify" => Ok(ScanMode::Inotify),
            other => Err(IndexError::InvalidConfig(format!(
                "illegal scan mode: {other}"
            ))),
        }
    }
}

/// How much work a rescan does per file.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanLevel {
    /// Only detect added and removed files.
    Basic,
    /// Also re-import files whose modification time moved past the watermark.
    Full,
}

impl ScanLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanLevel::Basic => "basic",
            ScanLevel::Full => "full",
        }
    }
}

impl fmt::Display for ScanLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanLevel {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(ScanLevel::Basic),
            "full" => Ok(ScanLevel::Full),
            other => Err(IndexError::InvalidConfig(format!(
                "illegal scan level: {other}"
            ))),
        }
    }
}

/// User-tunable parameters of a watched directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoscanSettings {
    pub mode: ScanMode,
    pub level: ScanLevel,
    pub recursive: bool,
    /// Import hidden files and descend into hidden directories.
    pub hidden: bool,
    /// Keep the watch when the directory disappears and resume once it is back.
    pub persistent: bool,
    /// Rescan period for [`ScanMode::Timed`].
    pub interval: Duration,
}

impl Default for AutoscanSettings {
    fn default() -> Self {
        Self {
            mode: ScanMode::Timed,
            level: ScanLevel::Basic,
            recursive: true,
            hidden: false,
            persistent: false,
            interval: Duration::from_secs(1800),
        }
    }
}

/// Persisted form of an autoscan directory. The scan id is runtime state and
/// is deliberately absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscanRecord {
    pub location: PathBuf,
    pub mode: ScanMode,
    pub level: ScanLevel,
    pub recursive: bool,
    pub hidden: bool,
    pub persistent: bool,
    pub interval_secs: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub object_id: Option<ObjectId>,
    pub storage_id: Option<ObjectId>,
}

#[derive(Clone, Debug)]
struct DirectoryState {
    settings: AutoscanSettings,
    scan_id: Option<ScanId>,
    object_id: Option<ObjectId>,
    storage_id: Option<ObjectId>,
    task_count: u32,
    last_mod_previous_scan: Option<DateTime<Utc>>,
    last_mod_current_scan: Option<DateTime<Utc>>,
}

/// A directory watched for changes.
///
/// Instances are shared between the registry, the scheduler's rescan tasks and
/// timer callbacks, so all mutable state sits behind an internal lock.
pub struct AutoscanDirectory {
    location: OnceLock<PathBuf>,
    state: Mutex<DirectoryState>,
}

pub type SharedDirectory = Arc<AutoscanDirectory>;

impl fmt::Debug for AutoscanDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AutoscanDirectory")
            .field("location", &self.location.get())
            .field("mode", &state.settings.mode)
            .field("scan_id", &state.scan_id)
            .field("object_id", &state.object_id)
            .field("task_count", &state.task_count)
            .finish()
    }
}

impl AutoscanDirectory {
    pub fn new(location: impl Into<PathBuf>, settings: AutoscanSettings) -> Self {
        let dir = Self::unlocated(settings);
        let _ = dir.location.set(location.into());
        dir
    }

    /// A directory whose location is filled in later with
    /// [`AutoscanDirectory::set_location`].
    pub fn unlocated(settings: AutoscanSettings) -> Self {
        Self {
            location: OnceLock::new(),
            state: Mutex::new(DirectoryState {
                settings,
                scan_id: None,
                object_id: None,
                storage_id: None,
                task_count: 0,
                last_mod_previous_scan: None,
                last_mod_current_scan: None,
            }),
        }
    }

    pub fn from_record(record: &AutoscanRecord) -> Self {
        let dir = Self::new(
            record.location.clone(),
            AutoscanSettings {
                mode: record.mode,
                level: record.level,
                recursive: record.recursive,
                hidden: record.hidden,
                persistent: record.persistent,
                interval: Duration::from_secs(record.interval_secs),
            },
        );
        {
            let mut state = dir.state.lock();
            state.object_id = record.object_id;
            state.storage_id = record.storage_id;
            state.last_mod_previous_scan = record.last_modified;
            state.last_mod_current_scan = record.last_modified;
        }
        dir
    }

    pub fn shared(self) -> SharedDirectory {
        Arc::new(self)
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.get().map(PathBuf::as_path)
    }

    /// Set the location. Only the first call succeeds; a directory never moves.
    pub fn set_location(&self, location: impl Into<PathBuf>) -> Result<()> {
        self.location.set(location.into()).map_err(|requested| {
            IndexError::InvalidLocationMutation {
                current: self.location.get().cloned().unwrap_or_default(),
                requested,
            }
        })
    }

    pub fn settings(&self) -> AutoscanSettings {
        self.state.lock().settings.clone()
    }

    pub fn update_settings(&self, settings: AutoscanSettings) {
        self.state.lock().settings = settings;
    }

    pub fn mode(&self) -> ScanMode {
        self.state.lock().settings.mode
    }

    pub fn level(&self) -> ScanLevel {
        self.state.lock().settings.level
    }

    pub fn recursive(&self) -> bool {
        self.state.lock().settings.recursive
    }

    pub fn hidden(&self) -> bool {
        self.state.lock().settings.hidden
    }

    pub fn persistent(&self) -> bool {
        self.state.lock().settings.persistent
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().settings.interval
    }

    pub fn scan_id(&self) -> Option<ScanId> {
        self.state.lock().scan_id
    }

    pub(crate) fn set_scan_id(&self, scan_id: Option<ScanId>) {
        self.state.lock().scan_id = scan_id;
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.state.lock().object_id
    }

    pub fn set_object_id(&self, object_id: Option<ObjectId>) {
        self.state.lock().object_id = object_id;
    }

    pub fn storage_id(&self) -> Option<ObjectId> {
        self.state.lock().storage_id
    }

    pub fn set_storage_id(&self, storage_id: Option<ObjectId>) {
        self.state.lock().storage_id = storage_id;
    }

    pub fn task_count(&self) -> u32 {
        self.state.lock().task_count
    }

    pub fn increment_task_count(&self) -> u32 {
        let mut state = self.state.lock();
        state.task_count += 1;
        state.task_count
    }

    /// Returns the number of rescans still in flight.
    pub fn decrement_task_count(&self) -> u32 {
        let mut state = self.state.lock();
        state.task_count = state.task_count.saturating_sub(1);
        state.task_count
    }

    /// Record a modification time seen during the current scan. Older values
    /// than the one already stored are discarded.
    pub fn set_current_lmt(&self, lmt: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        match state.last_mod_current_scan {
            Some(current) if lmt <= current => false,
            _ => {
                state.last_mod_current_scan = Some(lmt);
                true
            }
        }
    }

    pub fn current_lmt(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_mod_current_scan
    }

    pub fn previous_lmt(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_mod_previous_scan
    }

    /// Promote the current scan's watermark once the scan has finished.
    pub fn update_lmt(&self) {
        let mut state = self.state.lock();
        state.last_mod_previous_scan = state.last_mod_current_scan;
    }

    pub fn timer_parameter(&self) -> TimerParameter {
        let state = self.state.lock();
        TimerParameter {
            mode: state.settings.mode,
            scan_id: state.scan_id,
        }
    }

    /// Independent copy carrying every field, scan id included.
    pub fn duplicate(&self) -> AutoscanDirectory {
        let copy = AutoscanDirectory {
            location: OnceLock::new(),
            state: Mutex::new(self.state.lock().clone()),
        };
        if let Some(location) = self.location.get() {
            let _ = copy.location.set(location.clone());
        }
        copy
    }

    pub fn record(&self) -> Option<AutoscanRecord> {
        let location = self.location.get()?.clone();
        let state = self.state.lock();
        Some(AutoscanRecord {
            location,
            mode: state.settings.mode,
            level: state.settings.level,
            recursive: state.settings.recursive,
            hidden: state.settings.hidden,
            persistent: state.settings.persistent,
            interval_secs: state.settings.interval.as_secs(),
            last_modified: state.last_mod_previous_scan,
            object_id: state.object_id,
            storage_id: state.storage_id,
        })
    }
}
