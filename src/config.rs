use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub limits: LimitConfig,
    /// Reject an operation synchronously when the session's advertised
    /// permission list is missing a required permission.
    #[serde(default = "default_true")]
    pub precheck_permissions: bool,
    /// Completed operations retained for the history view.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// First remote-task poll interval, milliseconds.
    #[serde(default = "default_poll_initial_ms")]
    pub initial_ms: u64,
    /// Backoff ceiling, milliseconds.
    #[serde(default = "default_poll_max_ms")]
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Client-side cap on concurrent SR rescans within a batch.
    #[serde(default = "default_concurrent_rescans")]
    pub concurrent_rescans: usize,
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    200
}

fn default_poll_initial_ms() -> u64 {
    250
}

fn default_poll_max_ms() -> u64 {
    900
}

fn default_concurrent_rescans() -> usize {
    3
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_poll_initial_ms(),
            max_ms: default_poll_max_ms(),
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            concurrent_rescans: default_concurrent_rescans(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            limits: LimitConfig::default(),
            precheck_permissions: default_true(),
            history_limit: default_history_limit(),
        }
    }
}

impl PollConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.initial_ms))
    }
}

impl EngineConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("poolctl")
            .join("config.toml")
    }

    /// Load from a TOML file, falling back to defaults if it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
