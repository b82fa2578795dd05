// Settings shared by the CLI and the worker
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::Device;

pub const DEFAULT_SETTINGS_PATH: &str = "nanotest.json";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("device '{0}' is declared more than once")]
    DuplicateDevice(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Worker executable; defaults to `nanotest-worker` next to the CLI
    #[serde(default)]
    pub worker_path: Option<PathBuf>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default)]
    pub parallel_devices: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_invocation_timeout_ms() -> u64 {
    60_000
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_path: None,
            devices: Vec::new(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            parallel_devices: false,
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let settings: Settings = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load an explicit path, or the default path when present, or defaults.
    /// Environment overrides are applied last.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, SettingsError> {
        let settings = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_SETTINGS_PATH);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        Ok(settings.with_env_overrides())
    }

    /// `NANOTEST_WORKER` and `NANOTEST_LOG` take precedence over the file
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(worker) = std::env::var("NANOTEST_WORKER") {
            self.worker_path = Some(PathBuf::from(worker));
        }
        if let Ok(level) = std::env::var("NANOTEST_LOG") {
            self.log_level = level;
        }
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(SettingsError::DuplicateDevice(device.id.to_string()));
            }
        }
        Ok(())
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
