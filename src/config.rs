//! Engine Configuration
//!
//! Settings are read from a YAML file. Every field has a default, so a
//! missing file or a partial one is fine.
//!
//! # Config File Resolution
//!
//! 1. `HEALRUN_CONFIG` environment variable
//! 2. `healrun.yaml` next to the executable
//! 3. `healrun.yaml` in the current working directory
//!
//! # Example
//!
//! ```yaml
//! execution:
//!   max_concurrency: 4
//!   max_step_timeout_ms: 60000
//! healing:
//!   oracle_command: "python3 teach.py --repair"
//! storage:
//!   workflows_dir: flows
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::browser::RetryPolicy;
use crate::error::Result;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HEALRUN_CONFIG";

const CONFIG_FILE: &str = "healrun.yaml";

/// Lazily-resolved path of the config file.
pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            info!("Using config from {}: {}", CONFIG_ENV, path);
            return PathBuf::from(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let beside = exe_dir.join(CONFIG_FILE);
            if beside.exists() {
                info!("Using config next to executable: {}", beside.display());
                return beside;
            }
        }
    }

    PathBuf::from(CONFIG_FILE)
});

fn default_max_concurrency() -> usize {
    10
}

fn default_max_step_timeout_ms() -> u64 {
    120_000
}

fn default_screenshot_dir() -> PathBuf {
    PathBuf::from("screenshots")
}

fn default_true() -> bool {
    true
}

fn default_healing_timeout_secs() -> u64 {
    300
}

fn default_max_alternates() -> usize {
    5
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_backups_dir() -> PathBuf {
    PathBuf::from("workflows").join("backups")
}

fn default_history_dir() -> PathBuf {
    PathBuf::from(".healrun").join("history")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Runs executing at the same time
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Browser sessions in the pool; defaults to the CPU count, capped by
    /// `max_concurrency`
    #[serde(default)]
    pub pool_size: Option<usize>,

    /// Upper bound a timeout repair may raise a step budget to
    #[serde(default = "default_max_step_timeout_ms")]
    pub max_step_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            pool_size: None,
            max_step_timeout_ms: default_max_step_timeout_ms(),
            retry: RetryPolicy::default(),
            screenshot_dir: default_screenshot_dir(),
        }
    }
}

impl ExecutionConfig {
    pub fn effective_pool_size(&self) -> usize {
        let concurrency = self.max_concurrency.max(1);
        self.pool_size
            .unwrap_or_else(num_cpus::get)
            .clamp(1, concurrency)
    }

    pub fn max_step_timeout(&self) -> Duration {
        Duration::from_millis(self.max_step_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bound on one healing session, oracle call included
    #[serde(default = "default_healing_timeout_secs")]
    pub timeout_secs: u64,

    /// Alternate locators tried per missing element
    #[serde(default = "default_max_alternates")]
    pub max_alternates: usize,

    /// Command line of the external repair oracle
    #[serde(default)]
    pub oracle_command: Option<String>,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_healing_timeout_secs(),
            max_alternates: default_max_alternates(),
            oracle_command: None,
        }
    }
}

impl HealingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,

    #[serde(default = "default_backups_dir")]
    pub backups_dir: PathBuf,

    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            backups_dir: default_backups_dir(),
            history_dir: default_history_dir(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BrowserConfig {
    /// Command line of the browser automation process; unset means the
    /// simulated browser
    #[serde(default)]
    pub command: Option<String>,
}

/// Complete engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
}

impl EngineConfig {
    /// Loads the config from [`CONFIG_PATH`], falling back to defaults when
    /// the file is missing or unreadable.
    pub fn load() -> Self {
        let path: &Path = &CONFIG_PATH;
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        Self::from_path(path).unwrap_or_else(|e| {
            warn!("Ignoring config {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Loads the config from a specific file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
