//! Console configuration.
//!
//! Files are loaded in order (later wins):
//! 1. `<user config dir>/gesture-console/config.toml`
//! 2. `./gesture-console.toml`, or the `--config` path when one is given
//! 3. Environment variables (`GESTURE_CONSOLE_*`)
//!
//! ```toml
//! [backend]
//! url = "http://127.0.0.1:8000"
//! timeout_ms = 2000
//!
//! [camera]
//! index = 0
//!
//! [detector]
//! command = ["python3", "hand_detect.py"]
//! landmark_count = 21
//! reply_timeout_ms = 2000
//! ```
//!
//! `detector.command` has no default: the console does not ship a landmark
//! helper. Any program speaking the protocol described in
//! `pipeline::subprocess` works. Until one is configured, `start` and
//! `record` fail with "detector.command is not configured".

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LOCAL_CONFIG: &str = "gesture-console.toml";
const ENV_BACKEND_URL: &str = "GESTURE_CONSOLE_BACKEND_URL";
const ENV_CAMERA_INDEX: &str = "GESTURE_CONSOLE_CAMERA_INDEX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub backend: BackendConfig,
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub timeout_ms: u64,
    /// Extra attempts for a failed `/add_landmarks` upload.
    pub submit_retries: u32,
    pub submit_backoff_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_string(),
            timeout_ms: 2_000,
            submit_retries: 3,
            submit_backoff_ms: 500,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn submit_backoff(&self) -> Duration {
        Duration::from_millis(self.submit_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Program and arguments of the landmark helper process.
    pub command: Vec<String>,
    pub landmark_count: usize,
    /// Frames are downscaled to this size before detection; 0 keeps the
    /// camera resolution.
    pub input_width: u32,
    pub input_height: u32,
    pub min_confidence: f32,
    /// How long the helper may take to print `READY` (model loading).
    pub startup_timeout_ms: u64,
    /// How long the helper may take to answer one frame. A helper that
    /// misses this is killed and the session is ended.
    pub reply_timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            landmark_count: 21,
            input_width: 640,
            input_height: 480,
            min_confidence: 0.7,
            startup_timeout_ms: 30_000,
            reply_timeout_ms: 2_000,
        }
    }
}

impl DetectorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub default_target: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            default_target: 100,
        }
    }
}

impl ConsoleConfig {
    /// Load from the standard locations, then apply environment overrides.
    /// Returns the files that contributed, in load order.
    pub fn load(cli_path: Option<&Path>) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let files = discover_config_files(cli_path);
        let mut config = Self::from_files(&files)?;
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok((config, files))
    }

    pub fn from_files(files: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in files {
            let contents =
                std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                    path: path.clone(),
                    source,
                })?;
            let table: toml::Table =
                contents
                    .parse()
                    .map_err(|e: toml::de::Error| ConfigError::Parse {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
            merge_tables(&mut merged, table);
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: files.last().cloned().unwrap_or_default(),
                message: e.to_string(),
            })
    }

    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            self.backend.url = url;
        }
        if let Some(index) = lookup(ENV_CAMERA_INDEX) {
            self.camera.index = index.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_CAMERA_INDEX,
                message: format!("expected a camera index, got {index:?}"),
            })?;
        }
        Ok(())
    }
}

/// Only returns files that exist.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Some(dirs) = directories::ProjectDirs::from("", "", "gesture-console") {
        let user = dirs.config_dir().join("config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
        } else {
            log::warn!("config file {} does not exist", path.display());
        }
        return files;
    }

    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        files.push(local);
    }

    files
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
