//! Runtime configuration.
//!
//! Values come from an optional YAML file; command-line flags override them.
//! Every field has a default, so an empty file is a valid configuration.

use crate::mac::MacAddr;
use crate::tc::FilterOptions;
use crate::{FlowlatError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Installed location of the probe object when it is not embedded.
pub const DEFAULT_OBJECT_PATH: &str = "/usr/lib/flowlat/probes/flowlat-probe";

/// RLIMIT_MEMLOCK needed to pin the probe's program and maps.
pub const DEFAULT_MEMLOCK_LIMIT: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Interface to attach to.
    pub interface: String,
    /// Source address written into the probe's config table.
    pub mac: MacAddr,
    /// Probe object on disk. `None` uses the embedded object when built with
    /// `embed-probe`, otherwise [`DEFAULT_OBJECT_PATH`].
    pub object_path: Option<PathBuf>,
    pub program_name: String,
    pub config_map: String,
    pub events_map: String,
    pub memlock_limit_bytes: u64,
    pub filter: FilterOptions,
    pub export: ExportConfig,
    /// Exit non-zero when teardown leaves kernel objects behind.
    pub teardown_errors_fatal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            mac: MacAddr::ZERO,
            object_path: None,
            program_name: flowlat_common::PROGRAM_NAME.to_string(),
            config_map: flowlat_common::CONFIG_MAP.to_string(),
            events_map: flowlat_common::EVENTS_MAP.to_string(),
            memlock_limit_bytes: DEFAULT_MEMLOCK_LIMIT,
            filter: FilterOptions::default(),
            export: ExportConfig::default(),
            teardown_errors_fatal: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FlowlatError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents).map_err(|e| match e {
            FlowlatError::ConfigError(message) => {
                FlowlatError::ConfigError(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Config = serde_yaml::from_str(contents)
            .map_err(|e| FlowlatError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(FlowlatError::ConfigError("interface must not be empty".to_string()));
        }
        if self.program_name.is_empty() || self.config_map.is_empty() || self.events_map.is_empty() {
            return Err(FlowlatError::ConfigError(
                "program and map names must not be empty".to_string(),
            ));
        }
        if self.memlock_limit_bytes == 0 {
            return Err(FlowlatError::ConfigError(
                "memlock_limit_bytes must be greater than zero".to_string(),
            ));
        }
        if self.filter.priority == 0 {
            // Priority 0 asks the kernel to pick one, so a retry would stack a new filter.
            return Err(FlowlatError::ConfigError(
                "filter.priority must be greater than zero".to_string(),
            ));
        }
        if self.filter.handle == 0 {
            return Err(FlowlatError::ConfigError(
                "filter.handle must be greater than zero".to_string(),
            ));
        }
        self.export.validate()
    }
}

/// What the exporter does when the internal queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for the consumer (backpressure on the ring buffer).
    #[default]
    Block,
    /// Drop the newest record and count it.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Consecutive failed reads before the exporter gives up.
    pub max_consecutive_read_errors: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow: OverflowPolicy::Block,
            max_consecutive_read_errors: 32,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
        }
    }
}

impl ExportConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(FlowlatError::ConfigError(
                "export.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_consecutive_read_errors == 0 {
            return Err(FlowlatError::ConfigError(
                "export.max_consecutive_read_errors must be greater than zero".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(FlowlatError::ConfigError(format!(
                "export.initial_backoff_ms ({}) exceeds export.max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}
