//! Host configuration
//!
//! Where plugins and their data live, which plugins may load, and the
//! default/global resource budgets applied to every guest call.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::manifest::ResourceLimits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory scanned for plugin subdirectories.
    pub plugin_dir: PathBuf,
    /// Root of per-plugin persistent storage.
    pub data_dir: PathBuf,
    /// Allow-list; empty means every discovered plugin may load.
    pub enabled_plugins: Vec<String>,
    /// Deny-list; wins over `enabled_plugins`.
    pub disabled_plugins: Vec<String>,
    /// Limits applied where a manifest declares zero.
    pub default_limits: ResourceLimits,
    /// Hard ceiling no manifest can exceed.
    pub global_limits: ResourceLimits,
    /// Warm instances per plugin for burst dispatch. 1 serializes all calls.
    pub pool_size: usize,
    /// Granularity of the engine epoch ticker used for call deadlines.
    pub epoch_tick_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            data_dir: PathBuf::from("plugin_data"),
            enabled_plugins: Vec::new(),
            disabled_plugins: Vec::new(),
            default_limits: ResourceLimits::standard(),
            global_limits: ResourceLimits {
                max_memory_mb: 256,
                max_execution_ms: 1000,
                max_fuel: 10_000_000,
            },
            pool_size: 1,
            epoch_tick_ms: 10,
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> PluginResult<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| PluginError::ManifestInvalid {
            field: "config".to_string(),
            reason: e.to_string(),
        })
    }

    /// Load from `path`, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> PluginResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| PluginError::Internal(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Whether a plugin id passes the enable/disable filter. The disable
    /// list wins; an empty enable list allows everything.
    pub fn is_plugin_enabled(&self, id: &str) -> bool {
        if self.disabled_plugins.iter().any(|d| d == id) {
            return false;
        }
        if self.enabled_plugins.is_empty() {
            return true;
        }
        self.enabled_plugins.iter().any(|e| e == id)
    }

    /// Effective limits for one plugin: zero fields inherit the default,
    /// everything is floored against the global ceiling.
    pub fn effective_limits(&self, limits: ResourceLimits) -> ResourceLimits {
        let mut limits = limits;
        if limits.max_memory_mb == 0 {
            limits.max_memory_mb = self.default_limits.max_memory_mb;
        }
        if limits.max_execution_ms == 0 {
            limits.max_execution_ms = self.default_limits.max_execution_ms;
        }
        if limits.max_fuel == 0 {
            limits.max_fuel = self.default_limits.max_fuel;
        }

        limits.max_memory_mb = limits.max_memory_mb.min(self.global_limits.max_memory_mb);
        limits.max_execution_ms = limits
            .max_execution_ms
            .min(self.global_limits.max_execution_ms);
        limits.max_fuel = limits.max_fuel.min(self.global_limits.max_fuel);
        limits
    }
}
