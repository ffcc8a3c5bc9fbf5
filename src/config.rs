use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_LIBRARY_FILE: &str = "miniblink.dll";
const DEFAULT_STORAGE_PATH: &str = "LocalStorage";
const DEFAULT_COOKIE_FILE: &str = "cookie.dat";
const DEFAULT_IPC_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("ipc timeout must be greater than zero")]
    ZeroTimeout,
    #[error("temp directory {path} does not exist and could not be created: {source}")]
    TempDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Host configuration. Relative paths resolve under `temp_path`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub temp_path: PathBuf,
    pub library_file: PathBuf,
    pub storage_path: PathBuf,
    pub cookie_file: PathBuf,
    pub ipc_timeout_ms: u64,
    pub job_capacity: usize,
    pub wake_capacity: usize,
    pub loop_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_path: std::env::temp_dir().join("blink-host"),
            library_file: PathBuf::from(DEFAULT_LIBRARY_FILE),
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            cookie_file: PathBuf::from(DEFAULT_COOKIE_FILE),
            ipc_timeout_ms: DEFAULT_IPC_TIMEOUT_MS,
            job_capacity: 128,
            wake_capacity: 100,
            loop_interval_ms: 10,
        }
    }
}

impl Config {
    /// Load from an optional YAML file, then apply `BLINK_*` environment
    /// overrides. A missing file falls back to defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str::<Config>(&contents)?
            }
            _ => Config::default(),
        };

        if let Ok(path) = std::env::var("BLINK_TEMP_PATH") {
            config.temp_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BLINK_LIBRARY") {
            config.library_file = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("BLINK_IPC_TIMEOUT_MS") {
            config.ipc_timeout_ms =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv {
                        name: "BLINK_IPC_TIMEOUT_MS",
                        value,
                    })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipc_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn with_temp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_path = path.into();
        self
    }

    pub fn with_library_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_file = path.into();
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    pub fn with_cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookie_file = path.into();
        self
    }

    /// Sub-millisecond timeouts round up to one millisecond. Zero is kept
    /// and fails [`Config::validate`].
    pub fn with_ipc_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_millis().min(u64::MAX as u128) as u64;
        self.ipc_timeout_ms = if millis == 0 && !timeout.is_zero() { 1 } else { millis };
        self
    }

    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_timeout_ms)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn library_path(&self) -> PathBuf {
        self.resolve(&self.library_file)
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.resolve(&self.storage_path)
    }

    pub fn cookie_path(&self) -> PathBuf {
        self.resolve(&self.cookie_file)
    }

    pub fn ensure_temp_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.temp_path).map_err(|source| ConfigError::TempDir {
            path: self.temp_path.clone(),
            source,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.temp_path.join(path)
        }
    }
}
