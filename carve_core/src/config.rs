//! Boot configuration: the few host-level knobs that are not `$n`
//! machine settings.
//!
//! Loaded from TOML at startup; every field has a default so an empty
//! file (or none at all) boots a simulation-ready firmware.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boot-time configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    /// Non-volatile image file.
    #[serde(default = "default_nvs_path")]
    pub nvs_path: PathBuf,

    /// Default tracing filter (overridden by `RUST_LOG`).
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Step tick thread scheduling.
    #[serde(default)]
    pub rt: RtConfig,
}

/// Realtime scheduling knobs for the step tick thread. Only effective
/// with the `rt` cargo feature; otherwise documentation of intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtConfig {
    /// CPU core to pin the tick thread to.
    #[serde(default = "default_cpu_core")]
    pub cpu_core: usize,

    /// SCHED_FIFO priority.
    #[serde(default = "default_rt_priority")]
    pub rt_priority: i32,
}

fn default_nvs_path() -> PathBuf {
    PathBuf::from("carve_nvs.bin")
}
fn default_log_filter() -> String {
    "info".into()
}
fn default_cpu_core() -> usize {
    1
}
fn default_rt_priority() -> i32 {
    80
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            nvs_path: default_nvs_path(),
            log_filter: default_log_filter(),
            rt: RtConfig::default(),
        }
    }
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            cpu_core: default_cpu_core(),
            rt_priority: default_rt_priority(),
        }
    }
}

/// Boot configuration failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config invalid: {0}")]
    Invalid(String),
}

impl BootConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=99).contains(&self.rt.rt_priority) {
            return Err(ConfigError::Invalid(format!(
                "rt_priority {} out of range [1, 99]",
                self.rt.rt_priority
            )));
        }
        Ok(())
    }
}
