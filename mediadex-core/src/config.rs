use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::autoscan::{AutoscanSettings, ScanLevel, ScanMode};
use crate::cache::{STORAGE_CACHE_CAPACITY, STORAGE_CACHE_MAXFILL};
use crate::error::{IndexError, Result};

/// Settings of the content indexer.
///
/// Every field has a default so a configuration file only needs to mention
/// what it changes.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct IndexerConfig {
    /// Object cache sizing.
    pub cache: CacheConfig,
    /// Defaults applied to imports.
    pub import: ImportConfig,
    /// Directories watched from startup. These are always persistent.
    pub autoscan: Vec<AutoscanEntryConfig>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Occupancy ceiling; reaching it triggers eviction.
    pub capacity: usize,
    /// Occupancy eviction shrinks back to.
    pub max_fill: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: STORAGE_CACHE_CAPACITY,
            max_fill: STORAGE_CACHE_MAXFILL,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ImportConfig {
    /// Import hidden files unless a request says otherwise.
    pub hidden_files: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoscanEntryConfig {
    pub location: PathBuf,
    #[serde(default = "default_mode")]
    pub mode: ScanMode,
    #[serde(default = "default_level")]
    pub level: ScanLevel,
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// Falls back to [`ImportConfig::hidden_files`].
    #[serde(default)]
    pub hidden: Option<bool>,
    /// Rescan period for timed entries, in seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_mode() -> ScanMode {
    ScanMode::Timed
}

fn default_level() -> ScanLevel {
    ScanLevel::Basic
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    1800
}

impl AutoscanEntryConfig {
    pub fn new(location: impl Into<PathBuf>, mode: ScanMode) -> Self {
        Self {
            location: location.into(),
            mode,
            level: default_level(),
            recursive: true,
            hidden: None,
            interval_secs: default_interval_secs(),
        }
    }

    pub fn settings(&self, import: &ImportConfig) -> AutoscanSettings {
        AutoscanSettings {
            mode: self.mode,
            level: self.level,
            recursive: self.recursive,
            hidden: self.hidden.unwrap_or(import.hidden_files),
            persistent: true,
            interval: Duration::from_secs(self.interval_secs),
        }
    }
}

impl IndexerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity <= self.cache.max_fill {
            return Err(IndexError::InvalidConfig(format!(
                "cache.capacity ({}) must be greater than cache.max_fill ({})",
                self.cache.capacity, self.cache.max_fill
            )));
        }

        let mut seen = HashSet::new();
        for entry in &self.autoscan {
            if !entry.location.is_absolute() {
                return Err(IndexError::InvalidConfig(format!(
                    "autoscan location must be absolute: {}",
                    entry.location.display()
                )));
            }
            if entry.mode == ScanMode::Timed && entry.interval_secs == 0 {
                return Err(IndexError::InvalidConfig(format!(
                    "timed autoscan {} needs a non-zero interval",
                    entry.location.display()
                )));
            }
            if !seen.insert(&entry.location) {
                return Err(IndexError::InvalidConfig(format!(
                    "autoscan location listed twice: {}",
                    entry.location.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = IndexerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.capacity, 29989);
        assert_eq!(config.cache.max_fill, 9973);
    }

    #[test]
    fn rejects_inverted_cache_limits() {
        let config = IndexerConfig {
            cache: CacheConfig {
                capacity: 100,
                max_fill: 100,
            },
            ..IndexerConfig::default()
        };
        assert!(matches!(config.validate(), Err(IndexError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_interval_for_timed_entries_only() {
        let mut timed = AutoscanEntryConfig::new("/media", ScanMode::Timed);
        timed.interval_secs = 0;
        let config = IndexerConfig {
            autoscan: vec![timed],
            ..IndexerConfig::default()
        };
        assert!(config.validate().is_err());

        let mut inotify = AutoscanEntryConfig::new("/media", ScanMode::Inotify);
        inotify.interval_secs = 0;
        let config = IndexerConfig {
            autoscan: vec![inotify],
            ..IndexerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_and_relative_locations() {
        let config = IndexerConfig {
            autoscan: vec![
                AutoscanEntryConfig::new("/media", ScanMode::Timed),
                AutoscanEntryConfig::new("/media", ScanMode::Inotify),
            ],
            ..IndexerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = IndexerConfig {
            autoscan: vec![AutoscanEntryConfig::new("media", ScanMode::Timed)],
            ..IndexerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn configured_entries_are_persistent_and_inherit_hidden() {
        let entry = AutoscanEntryConfig::new("/media", ScanMode::Timed);
        let settings = entry.settings(&ImportConfig { hidden_files: true });
        assert!(settings.persistent);
        assert!(settings.hidden);
        assert_eq!(settings.interval, Duration::from_secs(1800));
    }
}
