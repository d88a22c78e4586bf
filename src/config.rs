//! Runtime settings.
//!
//! Settings are read from `{data_dir}/config.toml`; a missing file means
//! defaults. Environment variables override file values. The loaded
//! [`Settings`] is an immutable snapshot: changing it at runtime goes through
//! `Messenger::apply_settings`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::DEFAULT_EVENT_QUEUE_CAPACITY;
use crate::storage::{db_path, FullTextMode};

pub const DATA_DIR_ENV: &str = "PARLEY_HOME";
pub const MAX_FILE_SIZE_ENV: &str = "PARLEY_MAX_FILE_SIZE";
pub const NETWORK_TIMEOUT_ENV: &str = "PARLEY_NETWORK_TIMEOUT_SECS";

const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config write error: {0}")]
    Write(#[from] toml::ser::Error),
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where the database and config live. Not stored in the file itself.
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Largest file accepted for transfer, in bytes. `None` keeps the value
    /// persisted in the database.
    pub max_file_size: Option<u64>,
    pub network_timeout_secs: u64,
    /// Build and use the full-text search index when SQLite supports it.
    pub full_text_search: bool,
    /// Bound on inbound network events waiting for the dispatcher.
    pub event_queue_capacity: usize,
    /// Default destination for accepted files; `{data_dir}/downloads` if
    /// unset.
    pub download_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_file_size: None,
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
            full_text_search: true,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            download_dir: None,
        }
    }
}

impl Settings {
    /// Defaults rooted at `data_dir`, ignoring any config file.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        db_path(&self.data_dir)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }

    pub fn full_text_mode(&self) -> FullTextMode {
        if self.full_text_search {
            FullTextMode::Auto
        } else {
            FullTextMode::Disabled
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.network_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "network_timeout_secs",
                value: "0".to_string(),
            });
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: "event_queue_capacity",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Apply overrides from `lookup` (normally the process environment).
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(MAX_FILE_SIZE_ENV) {
            let max = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    name: MAX_FILE_SIZE_ENV,
                    value: value.clone(),
                })?;
            self.max_file_size = Some(max);
        }
        if let Some(value) = lookup(NETWORK_TIMEOUT_ENV) {
            self.network_timeout_secs =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        name: NETWORK_TIMEOUT_ENV,
                        value: value.clone(),
                    })?;
        }
        Ok(())
    }
}

/// `$PARLEY_HOME`, else `~/.parley`, else `.parley` in the working directory.
pub fn default_data_dir() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".parley"))
                .unwrap_or_else(|_| PathBuf::from(".parley"))
        })
}

/// Path to the config file.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Load settings for `data_dir`, returning defaults if no config file exists,
/// then apply environment overrides.
pub fn load_settings(data_dir: &Path) -> Result<Settings, ConfigError> {
    load_settings_with(data_dir, |name| std::env::var(name).ok())
}

fn load_settings_with<F>(data_dir: &Path, lookup: F) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let path = config_path(data_dir);
    let mut settings: Settings = if path.exists() {
        toml::from_str(&fs::read_to_string(&path)?)?
    } else {
        Settings::default()
    };
    settings.data_dir = data_dir.to_path_buf();
    settings.apply_overrides(lookup)?;
    settings.validate()?;
    Ok(settings)
}

/// Write `settings` to `{data_dir}/config.toml`.
pub fn save_settings(settings: &Settings) -> Result<(), ConfigError> {
    settings.validate()?;
    fs::create_dir_all(&settings.data_dir)?;
    let contents = toml::to_string_pretty(settings)?;
    fs::write(config_path(&settings.data_dir), contents)?;
    Ok(())
}
