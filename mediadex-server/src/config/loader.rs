use std::fs;
use std::path::{Path, PathBuf};

use mediadex_core::IndexError;
use mediadex_core::autoscan::ScanMode;
use mediadex_core::config::{AutoscanEntryConfig, IndexerConfig};
use thiserror::Error;

use super::sources::EnvConfig;

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["mediadex.toml", "config/mediadex.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Builds an [`IndexerConfig`] from a TOML file, an optional `.env` file and
/// `MEDIADEX_*` overrides, in increasing order of precedence.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: IndexerConfig,
    pub metadata: ConfigMetadata,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let mut load = self.load_with(|name| std::env::var(name).ok())?;
        load.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Like [`ConfigLoader::load`] but reads overrides through `lookup` and
    /// never touches `.env` files.
    pub fn load_with<F>(&self, lookup: F) -> Result<ConfigLoad, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvConfig::gather_from(lookup)?;
        let (file_config, config_path) = self.load_file_config(&env)?;
        let mut config = file_config.unwrap_or_default();
        apply_env(&mut config, &env);
        config.validate()?;

        Ok(ConfigLoad {
            config,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded: false,
            },
        })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<IndexerConfig>, Option<PathBuf>), ConfigLoadError> {
        let requested = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match requested {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(Path::new)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path.to_path_buf(),
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
            path: path.clone(),
            source: err,
        })?;
        let config: IndexerConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(config), Some(path)))
    }
}

fn apply_env(config: &mut IndexerConfig, env: &EnvConfig) {
    if let Some(capacity) = env.cache_capacity {
        config.cache.capacity = capacity;
    }
    if let Some(max_fill) = env.cache_max_fill {
        config.cache.max_fill = max_fill;
    }
    if let Some(hidden) = env.hidden_files {
        config.import.hidden_files = hidden;
    }
    for location in env.autoscan.iter().flatten() {
        if config.autoscan.iter().any(|entry| &entry.location == location) {
            continue;
        }
        let mut entry = AutoscanEntryConfig::new(location.clone(), ScanMode::Timed);
        if let Some(interval) = env.autoscan_interval_secs {
            entry.interval_secs = interval;
        }
        config.autoscan.push(entry);
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file {path} does not exist")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error(transparent)]
    Invalid(#[from] IndexError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use mediadex_core::autoscan::ScanLevel;
    use tempfile::NamedTempFile;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn config_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const SAMPLE: &str = r#"
[cache]
capacity = 200
max_fill = 50

[import]
hidden_files = true

[[autoscan]]
location = "/srv/movies"
mode = "inotify"
level = "full"

[[autoscan]]
location = "/srv/music"
interval_secs = 600
"#;

    #[test]
    fn reads_a_toml_file() {
        let file = config_file(SAMPLE);
        let load = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with(env(&[]))
            .unwrap();

        let config = load.config;
        assert_eq!(config.cache.capacity, 200);
        assert_eq!(config.cache.max_fill, 50);
        assert!(config.import.hidden_files);
        assert_eq!(config.autoscan.len(), 2);
        assert_eq!(config.autoscan[0].mode, ScanMode::Inotify);
        assert_eq!(config.autoscan[0].level, ScanLevel::Full);
        assert_eq!(config.autoscan[1].mode, ScanMode::Timed);
        assert_eq!(config.autoscan[1].interval_secs, 600);
        assert!(config.autoscan[1].recursive);
        assert_eq!(load.metadata.config_path.as_deref(), Some(file.path()));
        assert!(!load.metadata.env_file_loaded);
    }

    #[test]
    fn environment_overrides_the_file() {
        let file = config_file(SAMPLE);
        let config = ConfigLoader::new()
            .load_with(env(&[
                ("MEDIADEX_CONFIG", file.path().to_str().unwrap()),
                ("MEDIADEX_CACHE_CAPACITY", "300"),
                ("MEDIADEX_HIDDEN_FILES", "false"),
                ("MEDIADEX_AUTOSCAN", "/srv/music,/srv/photos"),
                ("MEDIADEX_AUTOSCAN_INTERVAL", "90"),
            ]))
            .unwrap()
            .config;

        assert_eq!(config.cache.capacity, 300);
        assert_eq!(config.cache.max_fill, 50);
        assert!(!config.import.hidden_files);

        let locations: Vec<_> = config
            .autoscan
            .iter()
            .map(|entry| entry.location.to_str().unwrap())
            .collect();
        assert_eq!(locations, vec!["/srv/movies", "/srv/music", "/srv/photos"]);
        // Entries from the file keep their own interval.
        assert_eq!(config.autoscan[1].interval_secs, 600);
        assert_eq!(config.autoscan[2].interval_secs, 90);
    }

    #[test]
    fn explicit_path_wins_over_the_environment() {
        let explicit = config_file("[cache]\ncapacity = 10\nmax_fill = 5\n");
        let from_env = config_file(SAMPLE);
        let config = ConfigLoader::new()
            .with_config_path(explicit.path())
            .load_with(env(&[("MEDIADEX_CONFIG", from_env.path().to_str().unwrap())]))
            .unwrap()
            .config;
        assert_eq!(config.cache.capacity, 10);
        assert!(config.autoscan.is_empty());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = ConfigLoader::new()
            .with_config_path(&missing)
            .load_with(env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { ref path } if *path == missing));
    }

    #[test]
    fn defaults_apply_without_any_source() {
        let load = ConfigLoader::new().load_with(env(&[])).unwrap();
        assert_eq!(load.config, IndexerConfig::default());
        assert_eq!(load.metadata, ConfigMetadata::default());
    }

    #[test]
    fn malformed_toml_reports_the_path() {
        let file = config_file("[cache\ncapacity = ");
        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with(env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse { ref path, .. } if path == file.path()));
    }

    #[test]
    fn invalid_result_is_rejected() {
        let err = ConfigLoader::new()
            .load_with(env(&[
                ("MEDIADEX_CACHE_CAPACITY", "10"),
                ("MEDIADEX_CACHE_MAX_FILL", "10"),
            ]))
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid(IndexError::InvalidConfig(_))));

        let err = ConfigLoader::new()
            .load_with(env(&[("MEDIADEX_AUTOSCAN", "relative/dir")]))
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid(_)));
    }

    #[test]
    fn missing_env_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = config_file(SAMPLE);
        let load = ConfigLoader::new()
            .with_config_path(file.path())
            .with_env_file(dir.path().join("missing.env"))
            .load()
            .unwrap();
        assert!(!load.metadata.env_file_loaded);
        assert_eq!(load.config.autoscan.len(), 2);
    }
}
