use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Directory scripts and bootstrap files are read from when nothing else is configured
pub const SCRIPT_PATH: &str = "resources/js";

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("IO error reading config: {0}")]
    IoError(String),
}

/// Transpiler that is loaded into every context and hidden from scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialectConfig {
    /// Bootstrap file, relative to the resource directory
    #[serde(default = "default_dialect_bootstrap")]
    pub bootstrap: String,

    /// Global binding the bootstrap defines (moved to the host-only namespace)
    #[serde(default = "default_dialect_global")]
    pub global: String,

    /// Name reported by `info()`
    #[serde(default = "default_dialect_global")]
    pub display_name: String,
}

fn default_dialect_bootstrap() -> String {
    "coffee-script.js".to_string()
}

fn default_dialect_global() -> String {
    "CoffeeScript".to_string()
}

impl Default for DialectConfig {
    fn default() -> Self {
        Self {
            bootstrap: default_dialect_bootstrap(),
            global: default_dialect_global(),
            display_name: default_dialect_global(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory containing bootstrap files and scripts (default: ./resources/js)
    #[serde(default)]
    pub resource_dir: Option<PathBuf>,

    /// Per-context execution bound in milliseconds, overriding the process-wide
    /// default. `0` disables the bound.
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,

    /// Period of the timer tick loop in milliseconds (default: 1ms)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Whether scripts may generate code from strings (eval, Function)
    #[serde(default)]
    pub allow_eval: bool,

    #[serde(default)]
    pub dialect: DialectConfig,

    /// Utility libraries loaded after the dialect, in order
    #[serde(default = "default_libraries")]
    pub libraries: Vec<String>,

    /// Heap limit for the engine; unlimited when unset
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,

    /// Stack limit for the engine; engine default when unset
    #[serde(default)]
    pub max_stack_bytes: Option<usize>,
}

fn default_tick_interval() -> u64 {
    1
}

fn default_libraries() -> Vec<String> {
    vec!["sugar-1.2.5.min.js".to_string()]
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            resource_dir: None,
            max_execution_time_ms: None,
            tick_interval_ms: default_tick_interval(),
            allow_eval: false,
            dialect: DialectConfig::default(),
            libraries: default_libraries(),
            memory_limit_bytes: None,
            max_stack_bytes: None,
        }
    }
}

impl SandboxConfig {
    /// Config rooted at a resource directory, everything else default
    pub fn with_resource_dir(resource_dir: impl Into<PathBuf>) -> Self {
        Self {
            resource_dir: Some(resource_dir.into()),
            ..Self::default()
        }
    }

    /// Get the resource directory (use provided or default)
    pub fn resource_dir(&self) -> PathBuf {
        if let Some(dir) = &self.resource_dir {
            return dir.clone();
        }

        let local = PathBuf::from(SCRIPT_PATH);
        if local.is_dir() {
            return local;
        }

        ProjectDirs::from("", "", "mmo")
            .map(|dirs| dirs.data_dir().join("js"))
            .unwrap_or(local)
    }

    /// Execution bound for this context; `None` defers to the process-wide default
    pub fn max_execution_time(&self) -> Option<Duration> {
        self.max_execution_time_ms.map(Duration::from_millis)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Default location of the sandbox config file
    pub fn config_path() -> PathBuf {
        ProjectDirs::from("", "", "mmo")
            .map(|dirs| dirs.config_dir().join("sandbox.toml"))
            .unwrap_or_else(|| PathBuf::from("sandbox.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.to_path_buf()));
        }

        let content =
            fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError(e.to_string()))?;
        let config = Self::from_toml(&content)?;
        info!(target: "scripting", "Loaded sandbox config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigLoadError> {
        toml::from_str(content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))
    }
}
