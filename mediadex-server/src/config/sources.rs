use std::path::PathBuf;

use super::loader::ConfigLoadError;

/// Overrides read from `MEDIADEX_*` environment variables.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub cache_capacity: Option<usize>,
    pub cache_max_fill: Option<usize>,
    pub hidden_files: Option<bool>,
    pub autoscan: Option<Vec<PathBuf>>,
    pub autoscan_interval_secs: Option<u64>,
}

impl EnvConfig {
    /// Read overrides through `lookup`, usually `std::env::var`.
    pub fn gather_from<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            config_path: lookup("MEDIADEX_CONFIG").map(PathBuf::from),
            cache_capacity: parse_number(&lookup, "MEDIADEX_CACHE_CAPACITY")?,
            cache_max_fill: parse_number(&lookup, "MEDIADEX_CACHE_MAX_FILL")?,
            hidden_files: parse_bool(&lookup, "MEDIADEX_HIDDEN_FILES")?,
            autoscan: parse_path_list(&lookup, "MEDIADEX_AUTOSCAN"),
            autoscan_interval_secs: parse_number(&lookup, "MEDIADEX_AUTOSCAN_INTERVAL")?,
        })
    }
}

fn parse_number<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigLoadError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigLoadError::InvalidEnv { name, value: raw }),
        None => Ok(None),
    }
}

fn parse_bool<F>(lookup: &F, name: &'static str) -> Result<Option<bool>, ConfigLoadError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigLoadError::InvalidEnv { name, value: raw }),
    }
}

fn parse_path_list<F>(lookup: &F, name: &str) -> Option<Vec<PathBuf>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).map(|raw| {
        raw.split(',')
            .filter_map(|part| {
                let trimmed = part.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(trimmed))
                }
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_has_no_overrides() {
        assert_eq!(EnvConfig::gather_from(env(&[])).unwrap(), EnvConfig::default());
    }

    #[test]
    fn parses_every_override() {
        let config = EnvConfig::gather_from(env(&[
            ("MEDIADEX_CONFIG", "/etc/mediadex.toml"),
            ("MEDIADEX_CACHE_CAPACITY", "500"),
            ("MEDIADEX_CACHE_MAX_FILL", " 100 "),
            ("MEDIADEX_HIDDEN_FILES", "Yes"),
            ("MEDIADEX_AUTOSCAN", "/srv/movies, ,/srv/music,"),
            ("MEDIADEX_AUTOSCAN_INTERVAL", "60"),
        ]))
        .unwrap();

        assert_eq!(config.config_path, Some(PathBuf::from("/etc/mediadex.toml")));
        assert_eq!(config.cache_capacity, Some(500));
        assert_eq!(config.cache_max_fill, Some(100));
        assert_eq!(config.hidden_files, Some(true));
        assert_eq!(
            config.autoscan,
            Some(vec![PathBuf::from("/srv/movies"), PathBuf::from("/srv/music")])
        );
        assert_eq!(config.autoscan_interval_secs, Some(60));
    }

    #[test]
    fn rejects_malformed_values() {
        let err = EnvConfig::gather_from(env(&[("MEDIADEX_HIDDEN_FILES", "maybe")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::InvalidEnv { name: "MEDIADEX_HIDDEN_FILES", .. }
        ));

        let err = EnvConfig::gather_from(env(&[("MEDIADEX_CACHE_CAPACITY", "-3")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::InvalidEnv { name: "MEDIADEX_CACHE_CAPACITY", .. }
        ));
    }
}
