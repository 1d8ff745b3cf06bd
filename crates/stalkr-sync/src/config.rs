use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stalkr_adapters::{spreadsheet_id_from_url, JDOWNLOADER_DEFAULT_ENDPOINT};
use stalkr_core::{normalize_token, BoundaryRule};
use thiserror::Error;

pub const CONFIG_ENV: &str = "STALKR_CONFIG";
pub const SHEETS_TOKEN_ENV: &str = "STALKR_SHEETS_TOKEN";
pub const YOUTUBE_API_KEY_ENV: &str = "STALKR_YOUTUBE_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("writing config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config field '{0}' is required")]
    MissingField(&'static str),
    #[error("config field '{field}' is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("environment variable {0} is not set")]
    MissingSecret(&'static str),
}

/// What `--hold` does to an eligible row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldBehavior {
    #[default]
    WriteStatus,
    LogOnly,
}

/// Per-operator settings file (`config/stalkr.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub initials: String,
    #[serde(default)]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub sheet_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub hold_behavior: HoldBehavior,
    #[serde(default = "default_archive_keywords")]
    pub archive_keywords: Vec<String>,
    #[serde(default = "default_min_keyword_matches")]
    pub min_keyword_matches: usize,
    #[serde(default = "default_jdownloader_endpoint")]
    pub jdownloader_endpoint: String,
    #[serde(default = "default_resolution")]
    pub default_resolution: String,
    #[serde(default = "default_description")]
    pub default_description: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_archive_keywords() -> Vec<String> {
    ["researcher name", "url", "title", "user"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_min_keyword_matches() -> usize {
    3
}

fn default_jdownloader_endpoint() -> String {
    JDOWNLOADER_DEFAULT_ENDPOINT.to_string()
}

fn default_resolution() -> String {
    "1080".to_string()
}

fn default_description() -> String {
    "DESCRIPTION".to_string()
}

impl UserConfig {
    /// `$STALKR_CONFIG`, else `./config/stalkr.yaml`.
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config/stalkr.yaml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data, path)
    }

    pub fn parse(yaml: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initials.trim().is_empty() {
            return Err(ConfigError::MissingField("initials"));
        }
        if normalize_token(&self.initials).is_empty() {
            return Err(ConfigError::Invalid {
                field: "initials",
                reason: "must contain at least one letter or digit".into(),
            });
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("download_dir"));
        }
        if self.sheet_url.trim().is_empty() {
            return Err(ConfigError::MissingField("sheet_url"));
        }
        if spreadsheet_id_from_url(&self.sheet_url).is_none() {
            return Err(ConfigError::Invalid {
                field: "sheet_url",
                reason: format!("no spreadsheet id in '{}'", self.sheet_url),
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.min_keyword_matches == 0 || self.min_keyword_matches > self.archive_keywords.len() {
            return Err(ConfigError::Invalid {
                field: "min_keyword_matches",
                reason: format!(
                    "must be between 1 and the number of archive keywords ({})",
                    self.archive_keywords.len()
                ),
            });
        }
        Ok(())
    }

    pub fn boundary_rule(&self) -> BoundaryRule {
        BoundaryRule::new(&self.archive_keywords, self.min_keyword_matches)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Persist the operator's tab choice. The only write-back this tool performs.
    pub fn save_tab(&mut self, path: &Path, tab: &str) -> Result<(), ConfigError> {
        self.tab = Some(tab.to_string());
        let yaml = serde_yaml::to_string(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Credentials read from the environment, never from the YAML file.
#[derive(Clone)]
pub struct Secrets {
    pub sheets_token: String,
    pub youtube_api_key: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

impl Secrets {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            sheets_token: required_env(SHEETS_TOKEN_ENV)?,
            youtube_api_key: required_env(YOUTUBE_API_KEY_ENV)?,
        })
    }
}

fn required_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingSecret(name))
}

/// Who is running the tool and how. Passed explicitly to every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorContext {
    pub initials: String,
    pub normalized_initials: String,
    pub download_dir: PathBuf,
    pub hold: bool,
    pub hold_behavior: HoldBehavior,
    pub default_resolution: String,
    pub default_description: String,
}

impl OperatorContext {
    pub fn new(initials: impl Into<String>, download_dir: impl Into<PathBuf>) -> Self {
        let initials = initials.into();
        Self {
            normalized_initials: normalize_token(&initials),
            initials: initials.trim().to_string(),
            download_dir: download_dir.into(),
            hold: false,
            hold_behavior: HoldBehavior::default(),
            default_resolution: default_resolution(),
            default_description: default_description(),
        }
    }

    pub fn from_config(config: &UserConfig, hold: bool) -> Self {
        Self {
            default_resolution: config.default_resolution.clone(),
            default_description: config.default_description.clone(),
            ..Self::new(&config.initials, &config.download_dir)
        }
        .with_hold(hold, config.hold_behavior)
    }

    pub fn with_hold(mut self, hold: bool, behavior: HoldBehavior) -> Self {
        self.hold = hold;
        self.hold_behavior = behavior;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "initials: PM\ndownload_dir: /data/downloads\nsheet_url: https://docs.google.com/spreadsheets/d/abc123/edit\n";

    #[test]
    fn minimal_config_gets_defaults() {
        let config = UserConfig::parse(MINIMAL, Path::new("inline.yaml")).expect("valid config");
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.hold_behavior, HoldBehavior::WriteStatus);
        assert_eq!(config.min_keyword_matches, 3);
        assert_eq!(config.jdownloader_endpoint, "http://127.0.0.1:9666");
        assert_eq!(config.default_resolution, "1080");
        assert_eq!(config.tab, None);
        assert_eq!(config.boundary_rule(), BoundaryRule::default());
    }

    #[test]
    fn missing_and_invalid_fields_are_named() {
        let err = UserConfig::parse("download_dir: /x\nsheet_url: abc\n", Path::new("c.yaml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("initials")));

        let yaml = format!("{MINIMAL}min_keyword_matches: 9\n");
        let err = UserConfig::parse(&yaml, Path::new("c.yaml")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "min_keyword_matches",
                ..
            }
        ));

        let err = UserConfig::parse(
            "initials: PM\ndownload_dir: /x\nsheet_url: https://example.com/nope\n",
            Path::new("c.yaml"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "sheet_url", .. }));
    }

    #[test]
    fn hold_behavior_parses_snake_case() {
        let yaml = format!("{MINIMAL}hold_behavior: log_only\n");
        let config = UserConfig::parse(&yaml, Path::new("c.yaml")).unwrap();
        let ctx = OperatorContext::from_config(&config, true);
        assert!(ctx.hold);
        assert_eq!(ctx.hold_behavior, HoldBehavior::LogOnly);
        assert_eq!(ctx.normalized_initials, "pm");
    }

    #[test]
    fn saving_tab_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stalkr.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let mut config = UserConfig::load(&path).unwrap();
        config.save_tab(&path, "Research").unwrap();

        let reloaded = UserConfig::load(&path).unwrap();
        assert_eq!(reloaded.tab.as_deref(), Some("Research"));
        assert_eq!(reloaded.initials, "PM");
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/stalkr.yaml"));
        let config = UserConfig::load(path).expect("example config parses");
        assert_eq!(config.initials, "PM");
        assert_eq!(config.tab, None);
        assert_eq!(config.boundary_rule(), BoundaryRule::default());
    }
}
